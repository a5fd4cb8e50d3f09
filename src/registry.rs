//! Named bridge registry. One process-wide instance lives behind the
//! control mutex; every control-plane mutation happens through it while
//! forwarder threads only ever touch the shared state inside each bridge.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::bridge::Bridge;
#[cfg(target_os = "linux")]
use crate::iol::IolBridge;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("'{0}' already exist")]
    NameExists(String),
    #[error("'{0}' doesn't exist")]
    NotFound(String),
}

pub type SharedRegistry = Arc<Mutex<Registry>>;

#[derive(Default)]
pub struct Registry {
    bridges: FxHashMap<String, Bridge>,
    #[cfg(target_os = "linux")]
    iol_bridges: FxHashMap<String, IolBridge>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn create_bridge(&mut self, name: &str) -> Result<&mut Bridge, RegistryError> {
        if self.bridges.contains_key(name) {
            return Err(RegistryError::NameExists(name.to_owned()));
        }
        Ok(self
            .bridges
            .entry(name.to_owned())
            .or_insert_with(|| Bridge::new(name)))
    }

    pub fn bridge(&mut self, name: &str) -> Option<&mut Bridge> {
        self.bridges.get_mut(name)
    }

    /// Dropping the bridge stops its workers and releases its NIOs.
    pub fn delete_bridge(&mut self, name: &str) -> bool {
        self.bridges.remove(name).is_some()
    }

    pub fn rename_bridge(&mut self, old: &str, new: &str) -> Result<(), RegistryError> {
        if !self.bridges.contains_key(old) {
            return Err(RegistryError::NotFound(old.to_owned()));
        }
        if self.bridges.contains_key(new) {
            return Err(RegistryError::NameExists(new.to_owned()));
        }
        let mut bridge = self.bridges.remove(old).expect("presence checked above");
        bridge.set_name(new);
        self.bridges.insert(new.to_owned(), bridge);
        Ok(())
    }

    pub fn bridges(&self) -> impl Iterator<Item = &Bridge> {
        self.bridges.values()
    }

    pub fn bridge_count(&self) -> usize {
        self.bridges.len()
    }

    #[cfg(target_os = "linux")]
    pub fn insert_iol_bridge(&mut self, bridge: IolBridge) {
        self.iol_bridges.insert(bridge.name().to_owned(), bridge);
    }

    #[cfg(target_os = "linux")]
    pub fn iol_bridge_exists(&self, name: &str) -> bool {
        self.iol_bridges.contains_key(name)
    }

    #[cfg(target_os = "linux")]
    pub fn iol_bridge(&mut self, name: &str) -> Option<&mut IolBridge> {
        self.iol_bridges.get_mut(name)
    }

    #[cfg(target_os = "linux")]
    pub fn delete_iol_bridge(&mut self, name: &str) -> bool {
        self.iol_bridges.remove(name).is_some()
    }

    #[cfg(target_os = "linux")]
    pub fn rename_iol_bridge(&mut self, old: &str, new: &str) -> Result<(), RegistryError> {
        if !self.iol_bridges.contains_key(old) {
            return Err(RegistryError::NotFound(old.to_owned()));
        }
        if self.iol_bridges.contains_key(new) {
            return Err(RegistryError::NameExists(new.to_owned()));
        }
        let mut bridge = self.iol_bridges.remove(old).expect("presence checked above");
        bridge.set_name(new);
        self.iol_bridges.insert(new.to_owned(), bridge);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    pub fn iol_bridges(&self) -> impl Iterator<Item = &IolBridge> {
        self.iol_bridges.values()
    }

    /// Destroys every bridge of both kinds.
    pub fn reset(&mut self) {
        self.bridges.clear();
        #[cfg(target_os = "linux")]
        self.iol_bridges.clear();
    }

    pub fn is_empty(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            self.bridges.is_empty() && self.iol_bridges.is_empty()
        }
        #[cfg(not(target_os = "linux"))]
        {
            self.bridges.is_empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        let mut registry = Registry::new();
        registry.create_bridge("a").unwrap();
        assert!(matches!(
            registry.create_bridge("a"),
            Err(RegistryError::NameExists(_))
        ));
    }

    #[test]
    fn create_delete_create_round_trips() {
        let mut registry = Registry::new();
        registry.create_bridge("again").unwrap();
        assert!(registry.delete_bridge("again"));
        assert!(!registry.delete_bridge("again"));
        registry.create_bridge("again").unwrap();
        assert_eq!(registry.bridge_count(), 1);
    }

    #[test]
    fn rename_refuses_taken_names() {
        let mut registry = Registry::new();
        registry.create_bridge("a").unwrap();
        registry.create_bridge("b").unwrap();

        assert!(matches!(
            registry.rename_bridge("a", "b"),
            Err(RegistryError::NameExists(_))
        ));
        assert!(matches!(
            registry.rename_bridge("ghost", "c"),
            Err(RegistryError::NotFound(_))
        ));

        registry.rename_bridge("a", "c").unwrap();
        assert!(registry.bridge("a").is_none());
        assert_eq!(registry.bridge("c").unwrap().name(), "c");
    }

    #[test]
    fn reset_leaves_the_registry_empty() {
        let mut registry = Registry::new();
        registry.create_bridge("one").unwrap();
        registry.create_bridge("two").unwrap();
        registry.reset();
        assert!(registry.is_empty());
    }
}
