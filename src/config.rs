//! INI configuration for batch mode. Each section names a bridge; parsing
//! is separated from NIO instantiation so configs can be validated without
//! touching devices or sockets.

use std::path::Path;

use ini::Ini;
use thiserror::Error;

use crate::bridge::Bridge;
use crate::capture::DEFAULT_LINKTYPE;
use crate::logger;
use crate::nio::{Nio, NioError};
use crate::registry::Registry;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot load configuration: {0}")]
    Ini(#[from] ini::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NioSpec {
    Udp {
        local_port: u16,
        remote_host: String,
        remote_port: u16,
    },
    Unix {
        local_path: String,
        remote_path: String,
    },
    Ethernet {
        device: String,
    },
    Tap {
        device: String,
    },
    LinuxRaw {
        device: String,
    },
    FusionVmnet {
        device: String,
    },
}

impl NioSpec {
    pub fn build(&self) -> Result<Nio, NioError> {
        match self {
            NioSpec::Udp {
                local_port,
                remote_host,
                remote_port,
            } => Nio::udp(*local_port, remote_host, *remote_port),
            NioSpec::Unix {
                local_path,
                remote_path,
            } => Nio::unix(local_path, remote_path),
            NioSpec::Ethernet { device } => Nio::ethernet(device),
            NioSpec::Tap { device } => Nio::tap(device),
            #[cfg(target_os = "linux")]
            NioSpec::LinuxRaw { device } => Nio::linux_raw(device),
            #[cfg(not(target_os = "linux"))]
            NioSpec::LinuxRaw { .. } => Err(NioError::InvalidParameter(
                "raw devices are only supported on Linux".to_owned(),
            )),
            #[cfg(target_os = "macos")]
            NioSpec::FusionVmnet { device } => Nio::fusion_vmnet(device),
            #[cfg(not(target_os = "macos"))]
            NioSpec::FusionVmnet { .. } => Err(NioError::InvalidParameter(
                "Fusion VMnet devices are only supported on macOS".to_owned(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub name: String,
    pub source: NioSpec,
    pub destination: NioSpec,
    pub pcap_file: Option<String>,
    pub pcap_linktype: String,
    pub pcap_filter: Option<String>,
}

/// Reads every section of `path`. Sections missing one of the two
/// endpoints are logged and skipped, matching the forgiving behavior the
/// reload path needs.
pub fn load(path: &Path) -> Result<Vec<BridgeConfig>, ConfigError> {
    let ini = Ini::load_from_file(path)?;
    let mut configs = Vec::new();

    for (section, properties) in ini.iter() {
        let Some(name) = section else { continue };
        logger::info(format!("parsing {name}"));

        let source = match parse_endpoint(properties, "source") {
            Some(Ok(spec)) => spec,
            Some(Err(message)) => {
                logger::error(format!("bridge '{name}': {message}"));
                continue;
            }
            None => {
                logger::error(format!("bridge '{name}': source NIO not found"));
                continue;
            }
        };
        let destination = match parse_endpoint(properties, "destination") {
            Some(Ok(spec)) => spec,
            Some(Err(message)) => {
                logger::error(format!("bridge '{name}': {message}"));
                continue;
            }
            None => {
                logger::error(format!("bridge '{name}': destination NIO not found"));
                continue;
            }
        };

        configs.push(BridgeConfig {
            name: name.to_owned(),
            source,
            destination,
            pcap_file: properties.get("pcap_file").map(str::to_owned),
            pcap_linktype: properties
                .get("pcap_protocol")
                .unwrap_or(DEFAULT_LINKTYPE)
                .to_owned(),
            pcap_filter: properties.get("pcap_filter").map(str::to_owned),
        });
    }
    Ok(configs)
}

fn parse_endpoint(
    properties: &ini::Properties,
    prefix: &str,
) -> Option<Result<NioSpec, String>> {
    if let Some(value) = properties.get(format!("{prefix}_udp")) {
        return Some(parse_udp(value));
    }
    if let Some(value) = properties.get(format!("{prefix}_unix")) {
        return Some(parse_unix(value));
    }
    if let Some(value) = properties.get(format!("{prefix}_ethernet")) {
        return Some(Ok(NioSpec::Ethernet {
            device: value.to_owned(),
        }));
    }
    if let Some(value) = properties.get(format!("{prefix}_tap")) {
        return Some(Ok(NioSpec::Tap {
            device: value.to_owned(),
        }));
    }
    if let Some(value) = properties.get(format!("{prefix}_linux_raw")) {
        return Some(Ok(NioSpec::LinuxRaw {
            device: value.to_owned(),
        }));
    }
    if let Some(value) = properties.get(format!("{prefix}_fusion_vmnet")) {
        return Some(Ok(NioSpec::FusionVmnet {
            device: value.to_owned(),
        }));
    }
    None
}

/// `<local_port>:<remote_host>:<remote_port>`; the host keeps any colons
/// of its own (IPv6 literals).
fn parse_udp(value: &str) -> Result<NioSpec, String> {
    let split = value
        .split_once(':')
        .and_then(|(local, rest)| rest.rsplit_once(':').map(|(host, remote)| (local, host, remote)));
    let Some((local, host, remote)) = split else {
        return Err(format!("invalid UDP tunnel syntax '{value}'"));
    };
    let local_port = local
        .parse::<u16>()
        .map_err(|_| format!("invalid local port '{local}'"))?;
    let remote_port = remote
        .parse::<u16>()
        .map_err(|_| format!("invalid remote port '{remote}'"))?;
    if host.is_empty() {
        return Err(format!("invalid UDP tunnel syntax '{value}'"));
    }
    Ok(NioSpec::Udp {
        local_port,
        remote_host: host.to_owned(),
        remote_port,
    })
}

fn parse_unix(value: &str) -> Result<NioSpec, String> {
    let Some((local, remote)) = value.split_once(':') else {
        return Err(format!("invalid UNIX domain socket syntax '{value}'"));
    };
    if local.is_empty() || remote.is_empty() {
        return Err(format!("invalid UNIX domain socket syntax '{value}'"));
    }
    Ok(NioSpec::Unix {
        local_path: local.to_owned(),
        remote_path: remote.to_owned(),
    })
}

/// Builds and registers the configured bridges. Bridges whose endpoints
/// fail to come up are logged and skipped; the count of registered
/// bridges is returned.
pub fn instantiate(registry: &mut Registry, configs: &[BridgeConfig]) -> usize {
    let mut created = 0;
    for config in configs {
        let source = match config.source.build() {
            Ok(nio) => nio,
            Err(err) => {
                logger::error(format!(
                    "bridge '{}': unable to create source NIO: {err}",
                    config.name
                ));
                continue;
            }
        };
        let destination = match config.destination.build() {
            Ok(nio) => nio,
            Err(err) => {
                logger::error(format!(
                    "bridge '{}': unable to create destination NIO: {err}",
                    config.name
                ));
                continue;
            }
        };

        let bridge = match registry.create_bridge(&config.name) {
            Ok(bridge) => bridge,
            Err(err) => {
                logger::error(format!("cannot create bridge: {err}"));
                continue;
            }
        };
        bridge.add_nio(source).expect("fresh bridge has empty slots");
        bridge
            .add_nio(destination)
            .expect("fresh bridge has one empty slot");

        configure_capture(bridge, config);
        created += 1;
    }
    created
}

fn configure_capture(bridge: &mut Bridge, config: &BridgeConfig) {
    if let Some(pcap_file) = &config.pcap_file {
        logger::info(format!(
            "starting packet capture to {pcap_file} with protocol {}",
            config.pcap_linktype
        ));
        if let Err(err) = bridge.start_capture(Path::new(pcap_file), &config.pcap_linktype) {
            logger::error(format!(
                "bridge '{}': cannot start capture: {err}",
                config.name
            ));
        }
    }
    if let Some(expression) = &config.pcap_filter {
        logger::info(format!("applying PCAP filter '{expression}'"));
        if let Err(err) = bridge.set_pcap_filter(expression) {
            logger::error(format!("bridge '{}': {err}", config.name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::path::PathBuf;

    fn write_config(name: &str, contents: &str) -> PathBuf {
        let path =
            std::env::temp_dir().join(format!("netbridge-cfg-{}-{name}.ini", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_udp_bridges_with_capture_options() {
        let path = write_config(
            "udp",
            "[br0]\n\
             source_udp = 20000:127.0.0.1:20001\n\
             destination_udp = 20001:127.0.0.1:20000\n\
             pcap_file = /tmp/br0.pcap\n\
             pcap_protocol = PPP_SERIAL\n\
             pcap_filter = udp dst port 53\n",
        );
        let configs = load(&path).unwrap();
        assert_eq!(configs.len(), 1);
        let config = &configs[0];
        assert_eq!(config.name, "br0");
        assert_eq!(
            config.source,
            NioSpec::Udp {
                local_port: 20000,
                remote_host: "127.0.0.1".to_owned(),
                remote_port: 20001,
            }
        );
        assert_eq!(config.pcap_file.as_deref(), Some("/tmp/br0.pcap"));
        assert_eq!(config.pcap_linktype, "PPP_SERIAL");
        assert_eq!(config.pcap_filter.as_deref(), Some("udp dst port 53"));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn udp_hosts_may_contain_colons() {
        let path = write_config(
            "ipv6",
            "[v6]\n\
             source_udp = 20000:fe80::1:20001\n\
             destination_udp = 20001:::1:20000\n",
        );
        let configs = load(&path).unwrap();
        assert_eq!(
            configs[0].source,
            NioSpec::Udp {
                local_port: 20000,
                remote_host: "fe80::1".to_owned(),
                remote_port: 20001,
            }
        );
        assert_eq!(
            configs[0].destination,
            NioSpec::Udp {
                local_port: 20001,
                remote_host: "::1".to_owned(),
                remote_port: 20000,
            }
        );
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn destination_linux_raw_fills_the_destination_slot() {
        let path = write_config(
            "raw",
            "[raw0]\n\
             source_udp = 30000:127.0.0.1:30001\n\
             destination_linux_raw = eth0\n",
        );
        let configs = load(&path).unwrap();
        assert_eq!(
            configs[0].destination,
            NioSpec::LinuxRaw {
                device: "eth0".to_owned(),
            }
        );
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn sections_missing_an_endpoint_are_skipped() {
        let path = write_config(
            "partial",
            "[half]\n\
             source_tap = tap0\n\
             [full]\n\
             source_tap = tap0\n\
             destination_tap = tap1\n",
        );
        let configs = load(&path).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "full");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn default_linktype_is_ethernet() {
        let path = write_config(
            "default",
            "[plain]\n\
             source_unix = /tmp/a.sock:/tmp/b.sock\n\
             destination_unix = /tmp/c.sock:/tmp/d.sock\n",
        );
        let configs = load(&path).unwrap();
        assert_eq!(configs[0].pcap_linktype, DEFAULT_LINKTYPE);
        assert_eq!(configs[0].pcap_file, None);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn bad_udp_syntax_is_reported() {
        assert!(parse_udp("20000:127.0.0.1").is_err());
        assert!(parse_udp("notaport:127.0.0.1:20001").is_err());
        assert!(parse_udp("20000::20001").is_err());
        assert!(parse_unix("/tmp/only-one-path").is_err());
    }

    #[test]
    fn instantiate_builds_and_registers_udp_bridges() {
        let mut registry = Registry::new();
        let configs = vec![BridgeConfig {
            name: "built".to_owned(),
            source: NioSpec::Udp {
                local_port: 0,
                remote_host: "127.0.0.1".to_owned(),
                remote_port: 39999,
            },
            destination: NioSpec::Udp {
                local_port: 0,
                remote_host: "127.0.0.1".to_owned(),
                remote_port: 39998,
            },
            pcap_file: None,
            pcap_linktype: DEFAULT_LINKTYPE.to_owned(),
            pcap_filter: None,
        }];
        assert_eq!(instantiate(&mut registry, &configs), 1);
        assert!(registry.bridge("built").is_some());
        assert_eq!(registry.bridge("built").unwrap().nio_count(), 2);
    }
}
