//! TAP device endpoint. On Linux the device is attached through
//! `/dev/net/tun`; other Unixes open the numbered `/dev/tap<N>` nodes.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use super::{wait_readable, NioError, RECV_POLL_TIMEOUT};

pub struct TapNio {
    fd: OwnedFd,
}

impl TapNio {
    pub fn new(device: &str) -> Result<Self, NioError> {
        let fd = open_tap(device)?;
        Ok(Self { fd })
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        // Safety: buf is a valid readable slice for the duration of the call.
        let written = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                buf.as_ptr().cast(),
                buf.len(),
            )
        };
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(written as usize)
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        wait_readable(self.fd.as_raw_fd(), RECV_POLL_TIMEOUT)?;
        // Safety: buf is a valid writable slice for the duration of the call.
        let received = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if received < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(received as usize)
    }
}

#[cfg(target_os = "linux")]
fn open_tap(device: &str) -> Result<OwnedFd, NioError> {
    const TAP_FLAGS: libc::c_short = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;

    if device.starts_with('/') {
        // A persistent device handed to us as a path: open it directly and
        // make sure it behaves like a plain TAP without the vnet header.
        let path = CString::new(device)
            .map_err(|_| NioError::InvalidParameter("TAP path contains NUL".to_owned()))?;
        // Safety: path is a valid NUL-terminated string.
        let raw = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // Safety: raw is a freshly opened, owned descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        // Safety: ifr is a valid ifreq for TUNGETIFF to fill in.
        if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TUNGETIFF, &mut ifr) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // Safety: TUNGETIFF initialized the flags member of the union.
        let mut flags = unsafe { ifr.ifr_ifru.ifru_flags };
        if flags & libc::IFF_VNET_HDR as libc::c_short != 0 {
            flags &= !(libc::IFF_VNET_HDR as libc::c_short);
            ifr.ifr_ifru.ifru_flags = flags;
            // Safety: ifr holds the device name and flags TUNGETIFF returned.
            if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TUNSETIFF, &ifr) } < 0 {
                return Err(NioError::InvalidParameter(format!(
                    "cannot clear the vnet header bit on {device}"
                )));
            }
        }
        if flags != TAP_FLAGS {
            return Err(NioError::InvalidParameter(format!(
                "{device} is not a plain TAP device (flags {flags:#x})"
            )));
        }
        Ok(fd)
    } else {
        if device.len() >= libc::IFNAMSIZ {
            return Err(NioError::InvalidParameter(format!(
                "TAP device name '{device}' too long"
            )));
        }
        let clone_dev = CString::new("/dev/net/tun").unwrap();
        // Safety: clone_dev is a valid NUL-terminated string.
        let raw = unsafe { libc::open(clone_dev.as_ptr(), libc::O_RDWR) };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // Safety: raw is a freshly opened, owned descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        ifr.ifr_ifru.ifru_flags = TAP_FLAGS;
        for (dst, src) in ifr.ifr_name.iter_mut().zip(device.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        // Safety: ifr carries a NUL-terminated name and valid flags.
        if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TUNSETIFF, &ifr) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(fd)
    }
}

#[cfg(not(target_os = "linux"))]
fn open_tap(device: &str) -> Result<OwnedFd, NioError> {
    let mut candidates = Vec::new();
    if device.is_empty() {
        for i in 0..16 {
            candidates.push(format!("/dev/tap{i}"));
        }
    } else {
        candidates.push(format!("/dev/{device}"));
    }

    let mut last_err = io::Error::from(io::ErrorKind::NotFound);
    for candidate in candidates {
        let path = CString::new(candidate)
            .map_err(|_| NioError::InvalidParameter("TAP path contains NUL".to_owned()))?;
        // Safety: path is a valid NUL-terminated string.
        let raw = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
        if raw >= 0 {
            // Safety: raw is a freshly opened, owned descriptor.
            return Ok(unsafe { OwnedFd::from_raw_fd(raw) });
        }
        last_err = io::Error::last_os_error();
    }
    Err(last_err.into())
}
