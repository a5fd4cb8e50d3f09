//! A bridge pairs two NIOs and runs one forwarder thread per direction
//! while started. NIO slots are immutable while running; the filter chain
//! and capture slot are the two pieces the control plane may swap out
//! underneath the workers, which is why they live behind their own locks.

mod forwarder;

#[cfg(test)]
mod tests;

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use thiserror::Error;

use crate::capture::{CaptureError, CaptureSink};
use crate::filter::{FilterChain, FilterError, PacketFilter};
use crate::nio::Nio;

use forwarder::ForwarderHalf;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge is already running")]
    AlreadyRunning,
    #[error("bridge is not running")]
    NotRunning,
    #[error("bridge must have 2 NIOs to be started")]
    MissingNios,
    #[error("bridge has already 2 allocated NIOs")]
    NioSlotsFull,
    #[error("packet capture is already active")]
    CaptureActive,
    #[error("no packet capture active")]
    CaptureInactive,
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("cannot create forwarder thread: {0}")]
    Spawn(io::Error),
}

pub struct Bridge {
    name: String,
    source_nio: Option<Arc<Nio>>,
    destination_nio: Option<Arc<Nio>>,
    filters: Arc<Mutex<FilterChain>>,
    capture: Arc<Mutex<Option<CaptureSink>>>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Bridge {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            source_nio: None,
            destination_nio: None,
            filters: Arc::new(Mutex::new(FilterChain::default())),
            capture: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_owned();
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    pub fn source_nio(&self) -> Option<&Arc<Nio>> {
        self.source_nio.as_ref()
    }

    pub fn destination_nio(&self) -> Option<&Arc<Nio>> {
        self.destination_nio.as_ref()
    }

    /// Fills the first empty NIO slot, source before destination.
    pub fn add_nio(&mut self, nio: Nio) -> Result<(), BridgeError> {
        if self.source_nio.is_none() {
            self.source_nio = Some(Arc::new(nio));
            Ok(())
        } else if self.destination_nio.is_none() {
            self.destination_nio = Some(Arc::new(nio));
            Ok(())
        } else {
            Err(BridgeError::NioSlotsFull)
        }
    }

    /// Removes the UDP NIO matching all of local port, remote host and
    /// remote port from whichever slot holds it. Callers must have stopped
    /// the bridge first.
    pub fn delete_nio_udp(&mut self, local_port: u16, remote_host: &str, remote_port: u16) -> bool {
        debug_assert!(!self.is_running());
        for slot in [&mut self.source_nio, &mut self.destination_nio] {
            if let Some(nio) = slot {
                if nio.udp_endpoints() == Some((local_port, remote_host, remote_port)) {
                    *slot = None;
                    return true;
                }
            }
        }
        false
    }

    pub fn start(&mut self) -> Result<(), BridgeError> {
        if self.is_running() {
            return Err(BridgeError::AlreadyRunning);
        }
        let (source, destination) = match (&self.source_nio, &self.destination_nio) {
            (Some(source), Some(destination)) => (source.clone(), destination.clone()),
            _ => return Err(BridgeError::MissingNios),
        };

        self.stop.store(false, Ordering::SeqCst);
        let source_half = ForwarderHalf {
            bridge_name: self.name.clone(),
            label: "source NIO",
            rx: source.clone(),
            tx: destination.clone(),
            filters: self.filters.clone(),
            capture: self.capture.clone(),
            stop: self.stop.clone(),
        };
        let destination_half = ForwarderHalf {
            bridge_name: self.name.clone(),
            label: "destination NIO",
            rx: destination,
            tx: source,
            filters: self.filters.clone(),
            capture: self.capture.clone(),
            stop: self.stop.clone(),
        };

        let source_worker = forwarder::spawn(source_half).map_err(BridgeError::Spawn)?;
        let destination_worker = match forwarder::spawn(destination_half) {
            Ok(worker) => worker,
            Err(err) => {
                self.stop.store(true, Ordering::SeqCst);
                let _ = source_worker.join();
                return Err(BridgeError::Spawn(err));
            }
        };
        self.workers = vec![source_worker, destination_worker];
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), BridgeError> {
        if !self.is_running() {
            return Err(BridgeError::NotRunning);
        }
        self.halt_workers();
        Ok(())
    }

    fn halt_workers(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    pub fn start_capture(&self, path: &Path, linktype: &str) -> Result<(), BridgeError> {
        let mut slot = self.capture.lock();
        if slot.is_some() {
            return Err(BridgeError::CaptureActive);
        }
        *slot = Some(CaptureSink::create(path, linktype)?);
        Ok(())
    }

    pub fn stop_capture(&self) -> Result<(), BridgeError> {
        let mut slot = self.capture.lock();
        if slot.take().is_none() {
            return Err(BridgeError::CaptureInactive);
        }
        Ok(())
    }

    pub fn add_filter(&self, name: &str, filter_type: &str, args: &[String]) -> Result<(), FilterError> {
        let filter = PacketFilter::new(name, filter_type, args)?;
        self.filters.lock().add(filter)
    }

    pub fn delete_filter(&self, name: &str) -> bool {
        self.filters.lock().delete(name)
    }

    pub fn reset_filters(&self) {
        self.filters.lock().clear();
    }

    pub fn filter_names(&self) -> Vec<String> {
        self.filters.lock().names().map(str::to_owned).collect()
    }

    pub fn reset_stats(&self) {
        if let Some(nio) = &self.source_nio {
            nio.stats().reset();
        }
        if let Some(nio) = &self.destination_nio {
            nio.stats().reset();
        }
    }

    /// Installs (or, with an empty expression, clears) a BPF filter on
    /// whichever slot holds an Ethernet NIO.
    pub fn set_pcap_filter(&self, expression: &str) -> Result<(), SetPcapFilterError> {
        for slot in [&self.source_nio, &self.destination_nio] {
            if let Some(nio) = slot {
                if nio.is_ethernet() {
                    return nio
                        .set_bpf_filter(expression)
                        .map_err(|err| SetPcapFilterError::Apply(err.to_string()));
                }
            }
        }
        Err(SetPcapFilterError::NoEthernetNio)
    }

    pub fn nio_count(&self) -> usize {
        usize::from(self.source_nio.is_some()) + usize::from(self.destination_nio.is_some())
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.halt_workers();
    }
}

#[derive(Debug, Error)]
pub enum SetPcapFilterError {
    #[error("bridge must have at least one Ethernet NIO in order to apply a filter")]
    NoEthernetNio,
    #[error("{0}")]
    Apply(String),
}
