//! `iol_bridge` module commands. Ports are addressed by bay/unit pairs.

use std::path::Path;

use super::{parse_arg, status, Command, Connection};
use crate::capture::DEFAULT_LINKTYPE;
use crate::iol::{IolBridge, IolError, MAX_PORTS};
use crate::logger;
use crate::nio::Nio;
use crate::registry::{Registry, RegistryError};

pub(super) static COMMANDS: &[Command] = &[
    Command { name: "create", min_args: 2, max_args: 2, handler: cmd_create },
    Command { name: "delete", min_args: 1, max_args: 1, handler: cmd_delete },
    Command { name: "start", min_args: 1, max_args: 1, handler: cmd_start },
    Command { name: "stop", min_args: 1, max_args: 1, handler: cmd_stop },
    Command { name: "get_stats", min_args: 1, max_args: 1, handler: cmd_get_stats },
    Command { name: "reset_stats", min_args: 1, max_args: 1, handler: cmd_reset_stats },
    Command { name: "rename", min_args: 2, max_args: 2, handler: cmd_rename },
    Command { name: "add_nio_udp", min_args: 7, max_args: 7, handler: cmd_add_nio_udp },
    Command { name: "delete_nio_udp", min_args: 3, max_args: 3, handler: cmd_delete_nio_udp },
    Command { name: "start_capture", min_args: 4, max_args: 5, handler: cmd_start_capture },
    Command { name: "stop_capture", min_args: 3, max_args: 3, handler: cmd_stop_capture },
    Command { name: "add_packet_filter", min_args: 5, max_args: 15, handler: cmd_add_packet_filter },
    Command { name: "delete_packet_filter", min_args: 4, max_args: 4, handler: cmd_delete_packet_filter },
    Command { name: "reset_packet_filters", min_args: 3, max_args: 3, handler: cmd_reset_packet_filters },
    Command { name: "list", min_args: 0, max_args: 0, handler: cmd_list },
];

fn with_iol_bridge<'a>(
    conn: &mut Connection,
    registry: &'a mut Registry,
    name: &str,
) -> Option<&'a mut IolBridge> {
    if registry.iol_bridge(name).is_none() {
        conn.send_reply(
            status::ERR_NOT_FOUND,
            true,
            format!("IOL bridge '{name}' doesn't exist"),
        );
        return None;
    }
    registry.iol_bridge(name)
}

fn reply_error(conn: &mut Connection, bridge_name: &str, err: IolError) {
    let (code, message) = match &err {
        IolError::LockedByOther { .. } | IolError::LockUnavailable(_) | IolError::Io(_) => (
            status::ERR_CREATE,
            format!("could not create IOL bridge '{bridge_name}': {err}"),
        ),
        IolError::IdCollision(id) => (
            status::ERR_CREATE,
            format!("IOU ID {id} cannot be the same as bridge '{bridge_name}' ID"),
        ),
        IolError::PortOutOfRange(key) => (
            status::ERR_CREATE,
            format!("Port number {key} exceeding {MAX_PORTS} on bridge '{bridge_name}'"),
        ),
        IolError::PortNotFound { bay, unit } => (
            status::ERR_NOT_FOUND,
            format!("port {bay}/{unit} doesn't exist"),
        ),
        IolError::CaptureActive { bay, unit } => (
            status::ERR_START,
            format!("packet capture is already active on port {bay}/{unit}"),
        ),
        IolError::CaptureInactive { bay, unit } => (
            status::ERR_NOT_FOUND,
            format!("no packet capture active on port {bay}/{unit}"),
        ),
        IolError::AlreadyRunning => (
            status::ERR_START,
            format!("IOL bridge '{bridge_name}' is already running"),
        ),
        IolError::NotRunning => (
            status::ERR_STOP,
            format!("IOL bridge '{bridge_name}' is not running"),
        ),
        IolError::Filter(err) => (status::ERR_CREATE, err.to_string()),
        IolError::Capture(err) => (
            status::ERR_START,
            format!("packet capture could not be started on bridge '{bridge_name}': {err}"),
        ),
        IolError::Spawn(err) => (
            status::ERR_START,
            format!("cannot create listener thread for IOL bridge '{bridge_name}': {err}"),
        ),
    };
    conn.send_reply(code, true, message);
}

fn cmd_create(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(application_id) = parse_arg::<u16>(conn, &args[1], "application ID") else {
        return;
    };
    if registry.iol_bridge_exists(&args[0]) {
        conn.send_reply(
            status::ERR_CREATE,
            true,
            format!("IOL bridge '{}' already exist", args[0]),
        );
        return;
    }
    // fcntl locks never conflict within one process, so a duplicate
    // application ID in our own registry has to be caught here.
    if registry
        .iol_bridges()
        .any(|bridge| bridge.application_id() == application_id)
    {
        conn.send_reply(
            status::ERR_CREATE,
            true,
            format!(
                "could not create IOL bridge '{}': PID {} already has a lock on ID {application_id}",
                args[0],
                std::process::id()
            ),
        );
        return;
    }
    match IolBridge::create(&args[0], application_id) {
        Ok(bridge) => {
            registry.insert_iol_bridge(bridge);
            conn.send_reply(
                status::INFO_OK,
                true,
                format!("IOL bridge '{}' created", args[0]),
            );
        }
        Err(err) => reply_error(conn, &args[0], err),
    }
}

fn cmd_delete(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    if registry.delete_iol_bridge(&args[0]) {
        conn.send_reply(
            status::INFO_OK,
            true,
            format!("IOL bridge '{}' deleted", args[0]),
        );
    } else {
        conn.send_reply(
            status::ERR_NOT_FOUND,
            true,
            format!("IOL bridge '{}' doesn't exist", args[0]),
        );
    }
}

fn cmd_start(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(bridge) = with_iol_bridge(conn, registry, &args[0]) else {
        return;
    };
    match bridge.start() {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("IOL bridge '{}' started", args[0]),
        ),
        Err(err) => reply_error(conn, &args[0], err),
    }
}

fn cmd_stop(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(bridge) = with_iol_bridge(conn, registry, &args[0]) else {
        return;
    };
    match bridge.stop() {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("IOL bridge '{}' stopped", args[0]),
        ),
        Err(err) => reply_error(conn, &args[0], err),
    }
}

fn cmd_get_stats(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(bridge) = with_iol_bridge(conn, registry, &args[0]) else {
        return;
    };
    for port in bridge.port_summaries() {
        conn.send_reply(
            status::INFO_MSG,
            false,
            format!(
                "port {}/{}:      IN: {} packets ({} bytes) OUT: {} packets ({} bytes)",
                port.bay,
                port.unit,
                port.stats.packets_in,
                port.stats.bytes_in,
                port.stats.packets_out,
                port.stats.bytes_out
            ),
        );
    }
    conn.send_reply(status::INFO_OK, true, "OK");
}

fn cmd_reset_stats(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(bridge) = with_iol_bridge(conn, registry, &args[0]) else {
        return;
    };
    bridge.reset_stats();
    conn.send_reply(status::INFO_OK, true, "OK");
}

fn cmd_rename(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    match registry.rename_iol_bridge(&args[0], &args[1]) {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("IOL bridge '{}' renamed to '{}'", args[0], args[1]),
        ),
        Err(RegistryError::NotFound(_)) => conn.send_reply(
            status::ERR_NOT_FOUND,
            true,
            format!("IOL bridge '{}' doesn't exist", args[0]),
        ),
        Err(RegistryError::NameExists(_)) => conn.send_reply(
            status::ERR_RENAME,
            true,
            format!("IOL bridge '{}' already exist", args[1]),
        ),
    }
}

fn cmd_list(conn: &mut Connection, registry: &mut Registry, _args: &[String]) {
    for bridge in registry.iol_bridges() {
        conn.send_reply(
            status::INFO_MSG,
            false,
            format!("{} (ports = {})", bridge.name(), bridge.port_count()),
        );
    }
    conn.send_reply(status::INFO_OK, true, "OK");
}

fn cmd_add_nio_udp(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some(iol_id) = parse_arg::<u16>(conn, &args[1], "IOU ID") else {
        return;
    };
    let Some(bay) = parse_arg::<u8>(conn, &args[2], "bay") else {
        return;
    };
    let Some(unit) = parse_arg::<u8>(conn, &args[3], "unit") else {
        return;
    };
    let Some(local_port) = parse_arg::<u16>(conn, &args[4], "local port") else {
        return;
    };
    let Some(remote_port) = parse_arg::<u16>(conn, &args[6], "remote port") else {
        return;
    };
    let Some(bridge) = with_iol_bridge(conn, registry, &args[0]) else {
        return;
    };
    let nio = match Nio::udp(local_port, &args[5], remote_port) {
        Ok(nio) => nio,
        Err(err) => {
            logger::error(format!("cannot create NIO UDP: {err}"));
            conn.send_reply(
                status::ERR_CREATE,
                true,
                format!("unable to create NIO UDP for IOL bridge '{}'", args[0]),
            );
            return;
        }
    };
    match bridge.add_nio_udp(iol_id, bay, unit, nio) {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("NIO UDP added to IOL bridge '{}'", args[0]),
        ),
        Err(err) => reply_error(conn, &args[0], err),
    }
}

fn port_args(conn: &mut Connection, args: &[String]) -> Option<(u8, u8)> {
    let bay = parse_arg::<u8>(conn, &args[1], "bay")?;
    let unit = parse_arg::<u8>(conn, &args[2], "unit")?;
    Some((bay, unit))
}

fn cmd_delete_nio_udp(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some((bay, unit)) = port_args(conn, args) else {
        return;
    };
    let Some(bridge) = with_iol_bridge(conn, registry, &args[0]) else {
        return;
    };
    match bridge.delete_nio(bay, unit) {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("NIO UDP deleted from IOL bridge '{}'", args[0]),
        ),
        Err(err) => reply_error(conn, &args[0], err),
    }
}

fn cmd_start_capture(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some((bay, unit)) = port_args(conn, args) else {
        return;
    };
    let Some(bridge) = with_iol_bridge(conn, registry, &args[0]) else {
        return;
    };
    let linktype = args.get(4).map(String::as_str).unwrap_or(DEFAULT_LINKTYPE);
    match bridge.start_port_capture(bay, unit, Path::new(&args[3]), linktype) {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("packet capture started on port {bay}/{unit}"),
        ),
        Err(err) => reply_error(conn, &args[0], err),
    }
}

fn cmd_stop_capture(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some((bay, unit)) = port_args(conn, args) else {
        return;
    };
    let Some(bridge) = with_iol_bridge(conn, registry, &args[0]) else {
        return;
    };
    match bridge.stop_port_capture(bay, unit) {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("packet capture stopped on port {bay}/{unit}"),
        ),
        Err(err) => reply_error(conn, &args[0], err),
    }
}

fn cmd_add_packet_filter(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some((bay, unit)) = port_args(conn, args) else {
        return;
    };
    let Some(bridge) = with_iol_bridge(conn, registry, &args[0]) else {
        return;
    };
    match bridge.add_port_filter(bay, unit, &args[3], &args[4], &args[5..]) {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!(
                "Filter '{}' type '{}' added to bridge '{}'",
                args[3], args[4], args[0]
            ),
        ),
        Err(IolError::Filter(err)) => {
            logger::error(format!("cannot add filter '{}': {err}", args[3]));
            conn.send_reply(
                status::ERR_CREATE,
                true,
                format!("Failed to add filter '{}'", args[3]),
            );
        }
        Err(err) => reply_error(conn, &args[0], err),
    }
}

fn cmd_delete_packet_filter(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some((bay, unit)) = port_args(conn, args) else {
        return;
    };
    let Some(bridge) = with_iol_bridge(conn, registry, &args[0]) else {
        return;
    };
    match bridge.delete_port_filter(bay, unit, &args[3]) {
        Ok(true) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("Filter '{}' deleted from bridge '{}'", args[3], args[0]),
        ),
        Ok(false) => conn.send_reply(
            status::ERR_CREATE,
            true,
            format!("Failed to delete filter '{}'", args[3]),
        ),
        Err(err) => reply_error(conn, &args[0], err),
    }
}

fn cmd_reset_packet_filters(conn: &mut Connection, registry: &mut Registry, args: &[String]) {
    let Some((bay, unit)) = port_args(conn, args) else {
        return;
    };
    let Some(bridge) = with_iol_bridge(conn, registry, &args[0]) else {
        return;
    };
    match bridge.reset_port_filters(bay, unit) {
        Ok(()) => conn.send_reply(status::INFO_OK, true, "OK"),
        Err(err) => reply_error(conn, &args[0], err),
    }
}
