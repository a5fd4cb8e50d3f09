//! Network I/O endpoints. A `Nio` is a bidirectional datagram transport
//! with per-direction counters; the concrete transport lives in a tagged
//! backend variant so bridges stay agnostic of what they forward between.

pub mod ethernet;
#[cfg(target_os = "macos")]
pub mod fusion;
#[cfg(target_os = "linux")]
pub mod linux_raw;
pub mod tap;
pub mod udp;
pub mod unixsock;

#[cfg(test)]
mod tests;

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::logger;

/// How long a blocking receive may wait before the caller gets a chance to
/// recheck its stop flag. Workers observe shutdown within this bound.
pub const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum NioError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("pcap: {0}")]
    Pcap(#[from] pcap::Error),
    #[error("{0}")]
    InvalidParameter(String),
}

/// Per-endpoint counters. Incremented only by the owning forwarder thread;
/// read and reset from the control plane, so relaxed atomics are enough.
#[derive(Debug, Default)]
pub struct NioStats {
    packets_in: AtomicU64,
    bytes_in: AtomicU64,
    packets_out: AtomicU64,
    bytes_out: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_in: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub bytes_out: u64,
}

impl NioStats {
    pub fn record_in(&self, bytes: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.packets_in.store(0, Ordering::Relaxed);
        self.bytes_in.store(0, Ordering::Relaxed);
        self.packets_out.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

pub enum NioBackend {
    Udp(udp::UdpNio),
    Unix(unixsock::UnixNio),
    Tap(tap::TapNio),
    Ethernet(ethernet::EthernetNio),
    #[cfg(target_os = "linux")]
    LinuxRaw(linux_raw::LinuxRawNio),
    #[cfg(target_os = "macos")]
    FusionVmnet(fusion::FusionNio),
}

pub struct Nio {
    backend: NioBackend,
    desc: String,
    stats: NioStats,
}

impl Nio {
    pub fn udp(local_port: u16, remote_host: &str, remote_port: u16) -> Result<Self, NioError> {
        let backend = udp::UdpNio::new(local_port, remote_host, remote_port)?;
        Ok(Self {
            backend: NioBackend::Udp(backend),
            desc: format!("{local_port}:{remote_host}:{remote_port}"),
            stats: NioStats::default(),
        })
    }

    pub fn unix(local_path: &str, remote_path: &str) -> Result<Self, NioError> {
        let backend = unixsock::UnixNio::new(local_path, remote_path)?;
        Ok(Self {
            backend: NioBackend::Unix(backend),
            desc: format!("{local_path} -> {remote_path}"),
            stats: NioStats::default(),
        })
    }

    pub fn tap(device: &str) -> Result<Self, NioError> {
        let backend = tap::TapNio::new(device)?;
        Ok(Self {
            backend: NioBackend::Tap(backend),
            desc: device.to_owned(),
            stats: NioStats::default(),
        })
    }

    pub fn ethernet(device: &str) -> Result<Self, NioError> {
        let backend = ethernet::EthernetNio::new(device)?;
        Ok(Self {
            backend: NioBackend::Ethernet(backend),
            desc: device.to_owned(),
            stats: NioStats::default(),
        })
    }

    #[cfg(target_os = "linux")]
    pub fn linux_raw(device: &str) -> Result<Self, NioError> {
        let backend = linux_raw::LinuxRawNio::new(device)?;
        Ok(Self {
            backend: NioBackend::LinuxRaw(backend),
            desc: device.to_owned(),
            stats: NioStats::default(),
        })
    }

    #[cfg(target_os = "macos")]
    pub fn fusion_vmnet(device: &str) -> Result<Self, NioError> {
        let backend = fusion::FusionNio::new(device)?;
        Ok(Self {
            backend: NioBackend::FusionVmnet(backend),
            desc: device.to_owned(),
            stats: NioStats::default(),
        })
    }

    /// Receives one frame into `buf`, truncating to its length. Returns a
    /// `WouldBlock`/`TimedOut` error when the poll interval elapsed without
    /// data; callers use that window to check their stop flag. The Linux raw
    /// backend may report a length larger than `buf` for frames the kernel
    /// truncated.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.backend {
            NioBackend::Udp(nio) => nio.recv(buf),
            NioBackend::Unix(nio) => nio.recv(buf),
            NioBackend::Tap(nio) => nio.recv(buf),
            NioBackend::Ethernet(nio) => nio.recv(buf),
            #[cfg(target_os = "linux")]
            NioBackend::LinuxRaw(nio) => nio.recv(buf),
            #[cfg(target_os = "macos")]
            NioBackend::FusionVmnet(nio) => nio.recv(buf),
        }
    }

    /// Sends one frame, returning the number of bytes written.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match &self.backend {
            NioBackend::Udp(nio) => nio.send(buf),
            NioBackend::Unix(nio) => nio.send(buf),
            NioBackend::Tap(nio) => nio.send(buf),
            NioBackend::Ethernet(nio) => nio.send(buf),
            #[cfg(target_os = "linux")]
            NioBackend::LinuxRaw(nio) => nio.send(buf),
            #[cfg(target_os = "macos")]
            NioBackend::FusionVmnet(nio) => nio.send(buf),
        }
    }

    pub fn description(&self) -> &str {
        &self.desc
    }

    pub fn stats(&self) -> &NioStats {
        &self.stats
    }

    pub fn is_tap(&self) -> bool {
        matches!(self.backend, NioBackend::Tap(_))
    }

    pub fn is_ethernet(&self) -> bool {
        matches!(self.backend, NioBackend::Ethernet(_))
    }

    /// `(local_port, remote_host, remote_port)` for UDP endpoints.
    pub fn udp_endpoints(&self) -> Option<(u16, &str, u16)> {
        match &self.backend {
            NioBackend::Udp(nio) => Some(nio.endpoints()),
            _ => None,
        }
    }

    /// Installs a BPF filter expression on an Ethernet endpoint; an empty
    /// expression compiles to an accept-all program and so clears it.
    pub fn set_bpf_filter(&self, expression: &str) -> Result<(), NioError> {
        match &self.backend {
            NioBackend::Ethernet(nio) => nio.set_filter(expression),
            _ => Err(NioError::InvalidParameter(
                "BPF filters require an Ethernet endpoint".to_owned(),
            )),
        }
    }
}

impl Drop for Nio {
    fn drop(&mut self) {
        logger::trace(
            logger::TraceFlags::FORWARD,
            format!("NIO {} destroyed", self.desc),
        );
    }
}

/// Transient receive/send failures: the peer is gone or the interface is
/// down, both of which resolve themselves. Forwarders keep running.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ECONNREFUSED) | Some(libc::ENETDOWN)
    ) || err.kind() == io::ErrorKind::Interrupted
}

/// Timeout-shaped errors produced by the poll interval on every backend.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Waits until `fd` is readable or the timeout elapses (`WouldBlock`).
pub(crate) fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // Safety: pfd points to a single valid pollfd for the duration of the call.
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
    match ret {
        0 => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        n if n < 0 => {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            } else {
                Err(err)
            }
        }
        _ => Ok(()),
    }
}
