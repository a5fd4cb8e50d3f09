//! `brctl` module commands: attach interfaces to kernel bridges.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use super::{status, Command, Connection};
use crate::netlink;
use crate::registry::Registry;

pub(super) static COMMANDS: &[Command] = &[Command {
    name: "addif",
    min_args: 2,
    max_args: 2,
    handler: cmd_addif,
}];

const SIOCBRADDIF: libc::c_ulong = 0x89a2;
const SIOCDEVPRIVATE: libc::c_ulong = 0x89f0;
const BRCTL_ADD_IF: libc::c_ulong = 4;

fn named_ifreq(name: &str) -> libc::ifreq {
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    ifr
}

fn add_interface(bridge: &str, ifindex: u32) -> io::Result<()> {
    // Safety: a plain stream socket just to carry the ioctls.
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: raw is a freshly opened, owned descriptor.
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut ifr = named_ifreq(bridge);
    ifr.ifr_ifru.ifru_ifindex = ifindex as libc::c_int;
    // Safety: ifr holds the bridge name and interface index.
    if unsafe { libc::ioctl(sock.as_raw_fd(), SIOCBRADDIF, &ifr) } >= 0 {
        return Ok(());
    }

    // Older kernels only speak the private brctl ioctl.
    let mut args: [libc::c_ulong; 4] = [BRCTL_ADD_IF, ifindex as libc::c_ulong, 0, 0];
    let mut ifr = named_ifreq(bridge);
    ifr.ifr_ifru.ifru_data = args.as_mut_ptr().cast();
    // Safety: ifr and args stay alive across the call.
    if unsafe { libc::ioctl(sock.as_raw_fd(), SIOCDEVPRIVATE, &ifr) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn cmd_addif(conn: &mut Connection, _registry: &mut Registry, args: &[String]) {
    let bridge = &args[0];
    let interface = &args[1];

    let ifindex = match netlink::interface_index(interface) {
        Ok(index) => index,
        Err(_) => {
            conn.send_reply(
                status::ERR_CREATE,
                true,
                format!("Could not found interface {interface}"),
            );
            return;
        }
    };

    match add_interface(bridge, ifindex) {
        Ok(()) => {}
        // Already a member of the bridge: nothing left to do.
        Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {}
        Err(err) => {
            conn.send_reply(
                status::ERR_CREATE,
                true,
                format!("Could not add interface {interface} to {bridge}: {err}"),
            );
            return;
        }
    }

    if netlink::set_link_up(interface).is_err() {
        conn.send_reply(
            status::ERR_CREATE,
            true,
            format!("Could not up interface {interface}"),
        );
        return;
    }

    conn.send_reply(
        status::INFO_OK,
        true,
        format!("{interface} has been added to bridge {bridge}"),
    );
}
