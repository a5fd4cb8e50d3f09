//! `bridge` module commands.

use std::path::Path;

use once_cell::sync::Lazy;

use super::{parse_arg, status, Command, Connection};
use crate::bridge::{Bridge, BridgeError, SetPcapFilterError};
use crate::capture::DEFAULT_LINKTYPE;
use crate::logger;
use crate::nio::Nio;
use crate::registry::{Registry, RegistryError};

pub(super) fn commands() -> &'static [Command] {
    static COMMANDS: Lazy<Vec<Command>> = Lazy::new(|| {
        let mut commands = vec![
            Command { name: "create", min_args: 1, max_args: 1, handler: cmd_create },
            Command { name: "delete", min_args: 1, max_args: 1, handler: cmd_delete },
            Command { name: "start", min_args: 1, max_args: 1, handler: cmd_start },
            Command { name: "stop", min_args: 1, max_args: 1, handler: cmd_stop },
            Command { name: "show", min_args: 1, max_args: 1, handler: cmd_show },
            Command { name: "get_stats", min_args: 1, max_args: 1, handler: cmd_get_stats },
            Command { name: "reset_stats", min_args: 1, max_args: 1, handler: cmd_reset_stats },
            Command { name: "rename", min_args: 2, max_args: 2, handler: cmd_rename },
            Command { name: "add_nio_udp", min_args: 4, max_args: 4, handler: cmd_add_nio_udp },
            // Kept for compatibility with older orchestrators.
            Command { name: "remove_nio_udp", min_args: 4, max_args: 4, handler: cmd_delete_nio_udp },
            Command { name: "delete_nio_udp", min_args: 4, max_args: 4, handler: cmd_delete_nio_udp },
            Command { name: "add_nio_unix", min_args: 3, max_args: 3, handler: cmd_add_nio_unix },
            Command { name: "add_nio_tap", min_args: 2, max_args: 2, handler: cmd_add_nio_tap },
            Command { name: "add_nio_ethernet", min_args: 2, max_args: 2, handler: cmd_add_nio_ethernet },
            Command { name: "start_capture", min_args: 2, max_args: 3, handler: cmd_start_capture },
            Command { name: "stop_capture", min_args: 1, max_args: 1, handler: cmd_stop_capture },
            Command { name: "add_packet_filter", min_args: 3, max_args: 10, handler: cmd_add_packet_filter },
            Command { name: "delete_packet_filter", min_args: 2, max_args: 2, handler: cmd_delete_packet_filter },
            Command { name: "reset_packet_filters", min_args: 1, max_args: 1, handler: cmd_reset_packet_filters },
            Command { name: "set_pcap_filter", min_args: 1, max_args: 2, handler: cmd_set_pcap_filter },
            Command { name: "list", min_args: 0, max_args: 0, handler: cmd_list },
        ];
        #[cfg(target_os = "linux")]
        commands.push(Command {
            name: "add_nio_linux_raw",
            min_args: 2,
            max_args: 2,
            handler: cmd_add_nio_linux_raw,
        });
        #[cfg(target_os = "macos")]
        commands.push(Command {
            name: "add_nio_fusion_vmnet",
            min_args: 2,
            max_args: 2,
            handler: cmd_add_nio_fusion_vmnet,
        });
        commands
    });
    &COMMANDS
}

fn with_bridge<'a>(
    conn: &mut Connection,
    registry: &'a mut Registry,
    name: &str,
) -> Option<&'a mut Bridge> {
    if registry.bridge(name).is_none() {
        conn.send_reply(
            status::ERR_NOT_FOUND,
            true,
            format!("bridge '{name}' doesn't exist"),
        );
        return None;
    }
    registry.bridge(name)
}

fn cmd_create(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    match registry.create_bridge(&args[0]) {
        Ok(_) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("bridge '{}' created", args[0]),
        ),
        Err(RegistryError::NameExists(_)) => conn.send_reply(
            status::ERR_CREATE,
            true,
            format!("bridge '{}' already exist", args[0]),
        ),
        Err(err) => conn.send_reply(
            status::ERR_CREATE,
            true,
            format!("could not create bridge '{}': {err}", args[0]),
        ),
    }
}

fn cmd_delete(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    if registry.delete_bridge(&args[0]) {
        conn.send_reply(
            status::INFO_OK,
            true,
            format!("bridge '{}' deleted", args[0]),
        );
    } else {
        conn.send_reply(
            status::ERR_NOT_FOUND,
            true,
            format!("bridge '{}' doesn't exist", args[0]),
        );
    }
}

fn cmd_start(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(bridge) = with_bridge(conn, registry, &args[0]) else {
        return;
    };
    match bridge.start() {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("bridge '{}' started", args[0]),
        ),
        Err(BridgeError::AlreadyRunning) => conn.send_reply(
            status::ERR_START,
            true,
            format!("bridge '{}' is already running", args[0]),
        ),
        Err(BridgeError::MissingNios) => conn.send_reply(
            status::ERR_START,
            true,
            format!("bridge '{}' must have 2 NIOs to be started", args[0]),
        ),
        Err(err) => conn.send_reply(
            status::ERR_START,
            true,
            format!("cannot start bridge '{}': {err}", args[0]),
        ),
    }
}

fn cmd_stop(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(bridge) = with_bridge(conn, registry, &args[0]) else {
        return;
    };
    match bridge.stop() {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("bridge '{}' stopped", args[0]),
        ),
        Err(_) => conn.send_reply(
            status::ERR_STOP,
            true,
            format!("bridge '{}' is not running", args[0]),
        ),
    }
}

fn cmd_show(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(bridge) = with_bridge(conn, registry, &args[0]) else {
        return;
    };
    if bridge.is_running() {
        conn.send_reply(
            status::INFO_MSG,
            false,
            format!("bridge '{}' is running", args[0]),
        );
    } else {
        conn.send_reply(
            status::INFO_MSG,
            false,
            format!("bridge '{}' is not running", args[0]),
        );
    }
    for (position, name) in bridge.filter_names().iter().enumerate() {
        conn.send_reply(
            status::INFO_MSG,
            false,
            format!("Filter '{name}' configured in position {}", position + 1),
        );
    }
    if let Some(nio) = bridge.source_nio() {
        conn.send_reply(
            status::INFO_MSG,
            false,
            format!("Source NIO: {}", nio.description()),
        );
    }
    if let Some(nio) = bridge.destination_nio() {
        conn.send_reply(
            status::INFO_MSG,
            false,
            format!("Destination NIO: {}", nio.description()),
        );
    }
    conn.send_reply(status::INFO_OK, true, "OK");
}

fn cmd_get_stats(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(bridge) = with_bridge(conn, registry, &args[0]) else {
        return;
    };
    if let Some(nio) = bridge.source_nio() {
        let stats = nio.stats().snapshot();
        conn.send_reply(
            status::INFO_MSG,
            false,
            format!(
                "Source NIO:      IN: {} packets ({} bytes) OUT: {} packets ({} bytes)",
                stats.packets_in, stats.bytes_in, stats.packets_out, stats.bytes_out
            ),
        );
    }
    if let Some(nio) = bridge.destination_nio() {
        let stats = nio.stats().snapshot();
        conn.send_reply(
            status::INFO_MSG,
            false,
            format!(
                "Destination NIO: IN: {} packets ({} bytes) OUT: {} packets ({} bytes)",
                stats.packets_in, stats.bytes_in, stats.packets_out, stats.bytes_out
            ),
        );
    }
    conn.send_reply(status::INFO_OK, true, "OK");
}

fn cmd_reset_stats(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(bridge) = with_bridge(conn, registry, &args[0]) else {
        return;
    };
    bridge.reset_stats();
    conn.send_reply(status::INFO_OK, true, "OK");
}

fn cmd_rename(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    match registry.rename_bridge(&args[0], &args[1]) {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("bridge '{}' renamed to '{}'", args[0], args[1]),
        ),
        Err(RegistryError::NotFound(_)) => conn.send_reply(
            status::ERR_NOT_FOUND,
            true,
            format!("bridge '{}' doesn't exist", args[0]),
        ),
        Err(RegistryError::NameExists(_)) => conn.send_reply(
            status::ERR_RENAME,
            true,
            format!("bridge '{}' already exist", args[1]),
        ),
    }
}

fn cmd_list(conn: &mut Connection, registry: &mut Registry, _args: &[String]) {
    for bridge in registry.bridges() {
        conn.send_reply(
            status::INFO_MSG,
            false,
            format!("{} (NIOs = {})", bridge.name(), bridge.nio_count()),
        );
    }
    conn.send_reply(status::INFO_OK, true, "OK");
}

/// Attaches a freshly created NIO, mirroring the add_nio_* commands.
fn attach_nio(
    conn: &mut Connection,
    registry: &mut Registry,
    bridge_name: &str,
    kind: &str,
    nio: Result<Nio, crate::nio::NioError>,
) {
    let Some(bridge) = with_bridge(conn, registry, bridge_name) else {
        return;
    };
    let nio = match nio {
        Ok(nio) => nio,
        Err(err) => {
            logger::error(format!("cannot create NIO {kind}: {err}"));
            conn.send_reply(
                status::ERR_CREATE,
                true,
                format!("unable to create NIO {kind} for bridge '{bridge_name}'"),
            );
            return;
        }
    };
    match bridge.add_nio(nio) {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("NIO {kind} added to bridge '{bridge_name}'"),
        ),
        Err(_) => conn.send_reply(
            status::ERR_CREATE,
            true,
            format!("bridge '{bridge_name}' has already 2 allocated NIOs"),
        ),
    }
}

fn cmd_add_nio_udp(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(local_port) = parse_arg::<u16>(conn, &args[1], "local port") else {
        return;
    };
    let Some(remote_port) = parse_arg::<u16>(conn, &args[3], "remote port") else {
        return;
    };
    let nio = Nio::udp(local_port, &args[2], remote_port);
    attach_nio(conn, registry, &args[0], "UDP", nio);
}

fn cmd_delete_nio_udp(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(local_port) = parse_arg::<u16>(conn, &args[1], "local port") else {
        return;
    };
    let Some(remote_port) = parse_arg::<u16>(conn, &args[3], "remote port") else {
        return;
    };
    let Some(bridge) = with_bridge(conn, registry, &args[0]) else {
        return;
    };
    if bridge.is_running() {
        conn.send_reply(
            status::ERR_NOT_FOUND,
            true,
            format!("bridge '{}' is running", args[0]),
        );
        return;
    }
    if bridge.delete_nio_udp(local_port, &args[2], remote_port) {
        conn.send_reply(
            status::INFO_OK,
            true,
            format!("NIO UDP removed from bridge '{}'", args[0]),
        );
    } else {
        conn.send_reply(
            status::ERR_NOT_FOUND,
            true,
            format!("UDP nio missing in '{}'", args[0]),
        );
    }
}

fn cmd_add_nio_unix(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let nio = Nio::unix(&args[1], &args[2]);
    attach_nio(conn, registry, &args[0], "UNIX", nio);
}

fn cmd_add_nio_tap(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let nio = Nio::tap(&args[1]);
    attach_nio(conn, registry, &args[0], "TAP", nio);
}

fn cmd_add_nio_ethernet(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let nio = Nio::ethernet(&args[1]);
    attach_nio(conn, registry, &args[0], "Ethernet", nio);
}

#[cfg(target_os = "linux")]
fn cmd_add_nio_linux_raw(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let nio = Nio::linux_raw(&args[1]);
    attach_nio(conn, registry, &args[0], "Linux raw", nio);
}

#[cfg(target_os = "macos")]
fn cmd_add_nio_fusion_vmnet(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let nio = Nio::fusion_vmnet(&args[1]);
    attach_nio(conn, registry, &args[0], "Fusion VMnet", nio);
}

fn cmd_start_capture(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(bridge) = with_bridge(conn, registry, &args[0]) else {
        return;
    };
    let linktype = args.get(2).map(String::as_str).unwrap_or(DEFAULT_LINKTYPE);
    match bridge.start_capture(Path::new(&args[1]), linktype) {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("packet capture started on bridge '{}'", args[0]),
        ),
        Err(BridgeError::CaptureActive) => conn.send_reply(
            status::ERR_START,
            true,
            format!("packet capture is already active on bridge '{}'", args[0]),
        ),
        Err(err) => {
            logger::error(format!("cannot start capture: {err}"));
            conn.send_reply(
                status::ERR_START,
                true,
                format!("packet capture could not be started on bridge '{}'", args[0]),
            );
        }
    }
}

fn cmd_stop_capture(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(bridge) = with_bridge(conn, registry, &args[0]) else {
        return;
    };
    match bridge.stop_capture() {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("packet capture stopped on bridge '{}'", args[0]),
        ),
        Err(_) => conn.send_reply(
            status::ERR_START,
            true,
            format!("no packet capture active on bridge '{}'", args[0]),
        ),
    }
}

fn cmd_add_packet_filter(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(bridge) = with_bridge(conn, registry, &args[0]) else {
        return;
    };
    match bridge.add_filter(&args[1], &args[2], &args[3..]) {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!(
                "Filter '{}' type '{}' added to bridge '{}'",
                args[1], args[2], args[0]
            ),
        ),
        Err(err) => {
            logger::error(format!("cannot add filter '{}': {err}", args[1]));
            conn.send_reply(
                status::ERR_CREATE,
                true,
                format!("Failed to add filter '{}'", args[1]),
            );
        }
    }
}

fn cmd_delete_packet_filter(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(bridge) = with_bridge(conn, registry, &args[0]) else {
        return;
    };
    if bridge.delete_filter(&args[1]) {
        conn.send_reply(
            status::INFO_OK,
            true,
            format!("Filter '{}' deleted from bridge '{}'", args[1], args[0]),
        );
    } else {
        conn.send_reply(
            status::ERR_CREATE,
            true,
            format!("Failed to delete filter '{}'", args[1]),
        );
    }
}

fn cmd_reset_packet_filters(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(bridge) = with_bridge(conn, registry, &args[0]) else {
        return;
    };
    bridge.reset_filters();
    conn.send_reply(status::INFO_OK, true, "OK");
}

fn cmd_set_pcap_filter(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(bridge) = with_bridge(conn, registry, &args[0]) else {
        return;
    };
    let expression = args.get(1).map(String::as_str).unwrap_or("");
    match bridge.set_pcap_filter(expression) {
        Ok(()) => {
            if expression.is_empty() {
                conn.send_reply(
                    status::INFO_OK,
                    true,
                    format!("filter reset on bridge '{}'", args[0]),
                );
            } else {
                conn.send_reply(
                    status::INFO_OK,
                    true,
                    format!("filter '{expression}' applied on bridge '{}'", args[0]),
                );
            }
        }
        Err(SetPcapFilterError::NoEthernetNio) => conn.send_reply(
            status::ERR_CREATE,
            true,
            format!(
                "bridge {} must have at least one Ethernet NIO in order to apply a filter",
                args[0]
            ),
        ),
        Err(SetPcapFilterError::Apply(err)) => {
            logger::error(format!("cannot apply pcap filter: {err}"));
            conn.send_reply(
                status::ERR_CREATE,
                true,
                format!("unable to apply filter on bridge {}", args[0]),
            );
        }
    }
}
