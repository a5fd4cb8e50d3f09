//! `docker` module commands: veth plumbing for container interconnects.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use super::{parse_arg, status, Command, Connection};
use crate::logger;
use crate::netlink;
use crate::registry::Registry;

pub(super) static COMMANDS: &[Command] = &[
    Command { name: "create_veth", min_args: 2, max_args: 2, handler: cmd_create_veth },
    Command { name: "delete_veth", min_args: 1, max_args: 1, handler: cmd_delete_veth },
    Command { name: "move_to_ns", min_args: 3, max_args: 3, handler: cmd_move_to_ns },
];

const SIOCETHTOOL: libc::c_ulong = 0x8946;
const ETHTOOL_STXCSUM: u32 = 0x17;

#[repr(C)]
struct EthtoolValue {
    cmd: u32,
    data: u32,
}

/// Turns TX checksum offload off. Required so the kernel keeps the
/// checksums computed inside the container instead of leaving them blank
/// for hardware that will never see the frame.
fn disable_tx_checksum(ifname: &str) -> io::Result<()> {
    if ifname.len() >= libc::IFNAMSIZ {
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }
    // Safety: a plain datagram socket just to carry the ioctl.
    let raw = unsafe { libc::socket(libc::PF_INET, libc::SOCK_DGRAM, libc::IPPROTO_IP) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: raw is a freshly opened, owned descriptor.
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut value = EthtoolValue {
        cmd: ETHTOOL_STXCSUM,
        data: 0,
    };
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(ifname.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_data = (&mut value as *mut EthtoolValue).cast();
    // Safety: ifr and value stay alive across the call.
    if unsafe { libc::ioctl(sock.as_raw_fd(), SIOCETHTOOL, &ifr) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn cmd_create_veth(conn: &mut Connection, _registry: &mut Registry, args: &[String]) {
    if args[0].len() >= libc::IFNAMSIZ || args[1].len() >= libc::IFNAMSIZ {
        conn.send_reply(status::ERR_CREATE, true, "name is too long");
        return;
    }
    if let Err(err) = netlink::create_veth_pair(&args[0], &args[1]) {
        logger::error(format!("veth creation failed: {err}"));
        conn.send_reply(
            status::ERR_CREATE,
            true,
            "could not complete netlink transaction",
        );
        return;
    }
    if let Err(err) = netlink::set_link_up(&args[0]) {
        logger::error(format!("failed to enable interface '{}': {err}", args[0]));
    }
    if disable_tx_checksum(&args[1]).is_err() {
        conn.send_reply(
            status::INFO_MSG,
            false,
            "Warning: could not turn off checksum",
        );
    }
    conn.send_reply(
        status::INFO_OK,
        true,
        format!("veth pair created: {} and {}", args[0], args[1]),
    );
}

fn cmd_delete_veth(conn: &mut Connection, _registry: &mut Registry, args: &[String]) {
    match netlink::delete_link(&args[0]) {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("veth interface {} has been deleted", args[0]),
        ),
        Err(err) => {
            logger::error(format!("veth deletion failed: {err}"));
            conn.send_reply(
                status::ERR_DELETE,
                true,
                format!("could not find interface index for {}", args[0]),
            );
        }
    }
}

fn cmd_move_to_ns(conn: &mut Connection, _registry: &mut Registry, args: &[String]) {
    let Some(pid) = parse_arg::<u32>(conn, &args[1], "PID") else {
        return;
    };
    match netlink::move_link_to_ns(&args[0], pid, &args[2]) {
        Ok(()) => conn.send_reply(
            status::INFO_OK,
            true,
            format!("{} moved to namespace {pid}", args[0]),
        ),
        Err(err) => {
            logger::error(format!("namespace move failed: {err}"));
            conn.send_reply(
                status::ERR_CREATE,
                true,
                "could not complete netlink transaction",
            );
        }
    }
}
