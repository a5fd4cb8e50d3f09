//! VMware Fusion vmnet endpoint (macOS). Talks to the vmnet kernel
//! extension through a kernel control socket and joins the virtual hub
//! matching the `vmnet<N>` interface name.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use super::{wait_readable, NioError, RECV_POLL_TIMEOUT};

const VMNET_KEXT_NAME: &[u8] = b"com.vmware.kext.vmnet";

// Control calls understood by the vmnet kext.
const VMNET_SO_APIVERSION: libc::c_int = 0;
const VMNET_SO_BINDTOHUB: libc::c_int = 3;
const VMNET_SO_IFFLAGS: libc::c_int = 6;

const AF_SYSTEM: libc::c_int = 32;
const AF_SYS_CONTROL: u16 = 2;
const SYSPROTO_CONTROL: libc::c_int = 2;
const CTLIOCGINFO: libc::c_ulong = 0xc064_4e03;
const MAX_KCTL_NAME: usize = 96;

#[repr(C)]
struct CtlInfo {
    ctl_id: u32,
    ctl_name: [libc::c_char; MAX_KCTL_NAME],
}

#[repr(C)]
struct SockaddrCtl {
    sc_len: u8,
    sc_family: u8,
    ss_sysaddr: u16,
    sc_id: u32,
    sc_unit: u32,
    sc_reserved: [u32; 5],
}

pub struct FusionNio {
    fd: OwnedFd,
}

impl FusionNio {
    pub fn new(device: &str) -> Result<Self, NioError> {
        let hub = device
            .strip_prefix("vmnet")
            .and_then(|n| n.parse::<libc::c_int>().ok())
            .ok_or_else(|| {
                NioError::InvalidParameter(format!("'{device}' is not a vmnet interface name"))
            })?;
        let fd = open_vmnet_socket(hub)?;
        Ok(Self { fd })
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        // Safety: buf is a valid readable slice for the duration of the call.
        let written = unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(written as usize)
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        wait_readable(self.fd.as_raw_fd(), RECV_POLL_TIMEOUT)?;
        // Safety: buf is a valid writable slice for the duration of the call.
        let received =
            unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if received < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(received as usize)
    }
}

fn open_vmnet_socket(hub: libc::c_int) -> Result<OwnedFd, NioError> {
    // Safety: plain socket creation.
    let raw = unsafe { libc::socket(AF_SYSTEM, libc::SOCK_DGRAM, SYSPROTO_CONTROL) };
    if raw < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // Safety: raw is a freshly opened, owned descriptor.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut info: CtlInfo = unsafe { mem::zeroed() };
    for (dst, src) in info.ctl_name.iter_mut().zip(VMNET_KEXT_NAME) {
        *dst = *src as libc::c_char;
    }
    // Safety: info is a valid ctl_info for the ioctl to fill in.
    if unsafe { libc::ioctl(fd.as_raw_fd(), CTLIOCGINFO, &mut info) } < 0 {
        return Err(io::Error::last_os_error().into());
    }

    let addr = SockaddrCtl {
        sc_len: mem::size_of::<SockaddrCtl>() as u8,
        sc_family: AF_SYSTEM as u8,
        ss_sysaddr: AF_SYS_CONTROL,
        sc_id: info.ctl_id,
        sc_unit: 0,
        sc_reserved: [0; 5],
    };
    // Connecting to the kext requires root.
    // Safety: addr is a valid sockaddr_ctl.
    if unsafe {
        libc::connect(
            fd.as_raw_fd(),
            (&addr as *const SockaddrCtl).cast(),
            mem::size_of::<SockaddrCtl>() as libc::socklen_t,
        )
    } < 0
    {
        return Err(io::Error::last_os_error().into());
    }

    // VMware bumps the major version whenever the kext ABI changes; 6 has
    // been stable since Fusion 2.0.5.
    let mut api_version: u32 = 0;
    let mut opt_len = mem::size_of::<u32>() as libc::socklen_t;
    // Safety: api_version/opt_len are valid out-parameters.
    if unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            SYSPROTO_CONTROL,
            VMNET_SO_APIVERSION,
            (&mut api_version as *mut u32).cast(),
            &mut opt_len,
        )
    } < 0
    {
        return Err(io::Error::last_os_error().into());
    }
    if api_version >> 16 != 6 {
        return Err(NioError::InvalidParameter(format!(
            "vmnet kext API version {} is unsupported (need 6)",
            api_version >> 16
        )));
    }

    // vmnet<N> is hub N; join another port on the same hub.
    // Safety: hub is a valid int option value.
    if unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SYSPROTO_CONTROL,
            VMNET_SO_BINDTOHUB,
            (&hub as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    } < 0
    {
        return Err(io::Error::last_os_error().into());
    }

    let flags: u32 = (libc::IFF_UP | libc::IFF_PROMISC) as u32;
    // Safety: flags is a valid int option value.
    if unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SYSPROTO_CONTROL,
            VMNET_SO_IFFLAGS,
            (&flags as *const u32).cast(),
            mem::size_of::<u32>() as libc::socklen_t,
        )
    } < 0
    {
        return Err(io::Error::last_os_error().into());
    }

    Ok(fd)
}
