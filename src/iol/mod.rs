//! IOL bridge: a one-to-many fan-out multiplexing up to 256 logical ports
//! over a single UNIX datagram "backplane" socket, framed with the 8-byte
//! IOU/IOL header. One bridge listener demuxes inbound backplane traffic;
//! each populated port runs its own listener feeding frames back onto the
//! backplane with a precomputed header.

mod lock;

#[cfg(test)]
mod tests;

use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use thiserror::Error;

use crate::capture::{CaptureError, CaptureSink};
use crate::filter::{run_chain, FilterChain, FilterError, PacketFilter};
use crate::logger::{self, TraceFlags};
use crate::nio::{is_timeout, is_transient, Nio, StatsSnapshot, RECV_POLL_TIMEOUT};

pub use lock::SocketLock;

pub const IOL_HDR_SIZE: usize = 8;
pub const MAX_PORTS: usize = 256;
/// Largest payload an IOL instance will exchange.
pub const MAX_MTU: usize = 0x1000;

const IOL_DST_PORT_OFFSET: usize = 4;
const IOL_MSG_TYPE_DATA: u8 = 1;

#[derive(Debug, Error)]
pub enum IolError {
    #[error("could not get lock on {0}")]
    LockUnavailable(String),
    #[error("PID {pid} already has a lock on ID {application_id}")]
    LockedByOther { pid: i32, application_id: u16 },
    #[error("IOU ID {0} cannot be the same as the bridge ID")]
    IdCollision(u16),
    #[error("port number {0} exceeding {MAX_PORTS}")]
    PortOutOfRange(usize),
    #[error("port {bay}/{unit} doesn't exist")]
    PortNotFound { bay: u8, unit: u8 },
    #[error("packet capture is already active on port {bay}/{unit}")]
    CaptureActive { bay: u8, unit: u8 },
    #[error("no packet capture active on port {bay}/{unit}")]
    CaptureInactive { bay: u8, unit: u8 },
    #[error("IOL bridge is already running")]
    AlreadyRunning,
    #[error("IOL bridge is not running")]
    NotRunning,
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("cannot create listener thread: {0}")]
    Spawn(io::Error),
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// The 8-byte header prefixed to every backplane frame. Multi-byte fields
/// are network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IolHeader {
    pub destination_id: u16,
    pub source_id: u16,
    pub destination_port: u8,
    pub source_port: u8,
    pub message_type: u8,
    pub channel: u8,
}

impl IolHeader {
    /// DATA header for frames sent from this bridge to peer `destination_id`
    /// on the logical port `port_key`.
    pub fn data(destination_id: u16, source_id: u16, port_key: u8) -> Self {
        Self {
            destination_id,
            source_id,
            destination_port: port_key,
            source_port: port_key,
            message_type: IOL_MSG_TYPE_DATA,
            channel: 0,
        }
    }

    pub fn to_bytes(self) -> [u8; IOL_HDR_SIZE] {
        let dst = self.destination_id.to_be_bytes();
        let src = self.source_id.to_be_bytes();
        [
            dst[0],
            dst[1],
            src[0],
            src[1],
            self.destination_port,
            self.source_port,
            self.message_type,
            self.channel,
        ]
    }

    pub fn from_bytes(bytes: &[u8; IOL_HDR_SIZE]) -> Self {
        Self {
            destination_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            source_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            destination_port: bytes[4],
            source_port: bytes[5],
            message_type: bytes[6],
            channel: bytes[7],
        }
    }
}

/// `/tmp/netio<uid>`, the rendezvous directory shared with IOL instances.
pub fn netio_directory() -> PathBuf {
    // Safety: getuid cannot fail.
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/netio{uid}"))
}

pub fn port_key(bay: u8, unit: u8) -> Result<usize, IolError> {
    let key = bay as usize + unit as usize * 16;
    if key >= MAX_PORTS {
        return Err(IolError::PortOutOfRange(key));
    }
    Ok(key)
}

struct IolPortShared {
    iol_id: u16,
    bay: u8,
    unit: u8,
    bridge_name: String,
    nio: Nio,
    header: [u8; IOL_HDR_SIZE],
    peer_path: PathBuf,
    filters: Mutex<FilterChain>,
    capture: Mutex<Option<CaptureSink>>,
    stop: AtomicBool,
    backplane: Arc<UnixDatagram>,
}

struct PortEntry {
    shared: Arc<IolPortShared>,
    worker: Option<JoinHandle<()>>,
}

impl PortEntry {
    fn halt(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

pub struct PortSummary {
    pub bay: u8,
    pub unit: u8,
    pub stats: StatsSnapshot,
}

pub struct IolBridge {
    name: String,
    application_id: u16,
    socket: Arc<UnixDatagram>,
    socket_path: PathBuf,
    _lock: SocketLock,
    ports: Arc<Mutex<Vec<Option<PortEntry>>>>,
    stop: Arc<AtomicBool>,
    bridge_worker: Option<JoinHandle<()>>,
}

impl IolBridge {
    /// Claims `/tmp/netio<uid>/<application_id>`: takes the advisory lock
    /// (reporting the holding PID on contention), replaces any stale socket
    /// file and binds the backplane.
    pub fn create(name: &str, application_id: u16) -> Result<Self, IolError> {
        let dir = netio_directory();
        if !dir.exists() {
            let mut builder = fs::DirBuilder::new();
            builder.mode(0o700);
            builder.create(&dir)?;
        }

        let socket_path = dir.join(application_id.to_string());
        let lock = match SocketLock::acquire(&socket_path) {
            Ok(lock) => lock,
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                return Err(match SocketLock::holder_pid(&socket_path) {
                    Some(pid) => IolError::LockedByOther {
                        pid,
                        application_id,
                    },
                    None => IolError::LockUnavailable(socket_path.display().to_string()),
                });
            }
            Err(err) => return Err(err.into()),
        };

        // A crashed predecessor may have left its socket behind.
        let _ = fs::remove_file(&socket_path);
        let socket = UnixDatagram::bind(&socket_path)?;
        socket.set_read_timeout(Some(RECV_POLL_TIMEOUT))?;

        let mut ports = Vec::with_capacity(MAX_PORTS);
        ports.resize_with(MAX_PORTS, || None);

        Ok(Self {
            name: name.to_owned(),
            application_id,
            socket: Arc::new(socket),
            socket_path,
            _lock: lock,
            ports: Arc::new(Mutex::new(ports)),
            stop: Arc::new(AtomicBool::new(false)),
            bridge_worker: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_owned();
    }

    pub fn application_id(&self) -> u16 {
        self.application_id
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_running(&self) -> bool {
        self.bridge_worker.is_some()
    }

    /// Installs `nio` at `bay`/`unit`, replacing (and joining) any previous
    /// port entry at that key. The port listener starts immediately when
    /// the bridge is already running.
    pub fn add_nio_udp(
        &mut self,
        iol_id: u16,
        bay: u8,
        unit: u8,
        nio: Nio,
    ) -> Result<(), IolError> {
        if iol_id == self.application_id {
            return Err(IolError::IdCollision(iol_id));
        }
        let key = port_key(bay, unit)?;

        let header = IolHeader::data(iol_id, self.application_id, key as u8).to_bytes();
        let shared = Arc::new(IolPortShared {
            iol_id,
            bay,
            unit,
            bridge_name: self.name.clone(),
            nio,
            header,
            peer_path: netio_directory().join(iol_id.to_string()),
            filters: Mutex::new(FilterChain::default()),
            capture: Mutex::new(None),
            stop: AtomicBool::new(false),
            backplane: self.socket.clone(),
        });

        let mut ports = self.ports.lock();
        if let Some(mut previous) = ports[key].take() {
            previous.halt();
        }
        let worker = if self.is_running() {
            Some(spawn_port_listener(shared.clone()).map_err(IolError::Spawn)?)
        } else {
            None
        };
        ports[key] = Some(PortEntry { shared, worker });
        Ok(())
    }

    /// Joins and destroys the port entry at `bay`/`unit`.
    pub fn delete_nio(&mut self, bay: u8, unit: u8) -> Result<(), IolError> {
        let key = port_key(bay, unit)?;
        let mut ports = self.ports.lock();
        match ports[key].take() {
            Some(mut entry) => {
                entry.halt();
                Ok(())
            }
            None => Err(IolError::PortNotFound { bay, unit }),
        }
    }

    pub fn start(&mut self) -> Result<(), IolError> {
        if self.is_running() {
            return Err(IolError::AlreadyRunning);
        }
        self.stop.store(false, Ordering::SeqCst);

        let worker = spawn_bridge_listener(
            self.name.clone(),
            self.application_id,
            self.socket.clone(),
            self.ports.clone(),
            self.stop.clone(),
        )
        .map_err(IolError::Spawn)?;
        self.bridge_worker = Some(worker);

        let mut ports = self.ports.lock();
        for entry in ports.iter_mut().flatten() {
            entry.shared.stop.store(false, Ordering::SeqCst);
            entry.worker = Some(spawn_port_listener(entry.shared.clone()).map_err(IolError::Spawn)?);
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), IolError> {
        if !self.is_running() {
            return Err(IolError::NotRunning);
        }
        self.halt_workers();
        Ok(())
    }

    /// Raises every stop flag before joining anything so teardown latency
    /// is bounded by one poll interval, not one per worker.
    fn halt_workers(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        {
            let ports = self.ports.lock();
            for entry in ports.iter().flatten() {
                entry.shared.stop.store(true, Ordering::SeqCst);
            }
        }
        if let Some(worker) = self.bridge_worker.take() {
            let _ = worker.join();
        }
        let mut ports = self.ports.lock();
        for entry in ports.iter_mut().flatten() {
            if let Some(worker) = entry.worker.take() {
                let _ = worker.join();
            }
        }
    }

    pub fn port_count(&self) -> usize {
        self.ports.lock().iter().flatten().count()
    }

    pub fn port_summaries(&self) -> Vec<PortSummary> {
        self.ports
            .lock()
            .iter()
            .flatten()
            .map(|entry| PortSummary {
                bay: entry.shared.bay,
                unit: entry.shared.unit,
                stats: entry.shared.nio.stats().snapshot(),
            })
            .collect()
    }

    pub fn reset_stats(&self) {
        for entry in self.ports.lock().iter().flatten() {
            entry.shared.nio.stats().reset();
        }
    }

    fn with_port<R>(
        &self,
        bay: u8,
        unit: u8,
        op: impl FnOnce(&IolPortShared) -> Result<R, IolError>,
    ) -> Result<R, IolError> {
        let key = port_key(bay, unit)?;
        let ports = self.ports.lock();
        match &ports[key] {
            Some(entry) => op(&entry.shared),
            None => Err(IolError::PortNotFound { bay, unit }),
        }
    }

    pub fn add_port_filter(
        &self,
        bay: u8,
        unit: u8,
        name: &str,
        filter_type: &str,
        args: &[String],
    ) -> Result<(), IolError> {
        self.with_port(bay, unit, |port| {
            let filter = PacketFilter::new(name, filter_type, args)?;
            port.filters.lock().add(filter)?;
            Ok(())
        })
    }

    pub fn delete_port_filter(&self, bay: u8, unit: u8, name: &str) -> Result<bool, IolError> {
        self.with_port(bay, unit, |port| Ok(port.filters.lock().delete(name)))
    }

    pub fn reset_port_filters(&self, bay: u8, unit: u8) -> Result<(), IolError> {
        self.with_port(bay, unit, |port| {
            port.filters.lock().clear();
            Ok(())
        })
    }

    pub fn start_port_capture(
        &self,
        bay: u8,
        unit: u8,
        path: &Path,
        linktype: &str,
    ) -> Result<(), IolError> {
        self.with_port(bay, unit, |port| {
            let mut slot = port.capture.lock();
            if slot.is_some() {
                return Err(IolError::CaptureActive { bay, unit });
            }
            *slot = Some(CaptureSink::create(path, linktype)?);
            Ok(())
        })
    }

    pub fn stop_port_capture(&self, bay: u8, unit: u8) -> Result<(), IolError> {
        self.with_port(bay, unit, |port| {
            if port.capture.lock().take().is_none() {
                return Err(IolError::CaptureInactive { bay, unit });
            }
            Ok(())
        })
    }
}

impl Drop for IolBridge {
    fn drop(&mut self) {
        self.halt_workers();
        let _ = fs::remove_file(&self.socket_path);
    }
}

fn spawn_bridge_listener(
    name: String,
    application_id: u16,
    socket: Arc<UnixDatagram>,
    ports: Arc<Mutex<Vec<Option<PortEntry>>>>,
    stop: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("iol-{name}"))
        .spawn(move || {
            logger::info(format!(
                "IOL bridge listener thread for {name} with ID {application_id} has started"
            ));
            bridge_listener(&name, &socket, &ports, &stop);
            logger::info(format!(
                "IOL bridge listener thread for {name} with ID {application_id} has stopped"
            ));
        })
}

/// Demuxes backplane datagrams: byte 4 addresses the logical port, the
/// header is stripped and the payload forwarded through that port's NIO.
fn bridge_listener(
    name: &str,
    socket: &UnixDatagram,
    ports: &Mutex<Vec<Option<PortEntry>>>,
    stop: &AtomicBool,
) {
    let mut pkt = vec![0u8; IOL_HDR_SIZE + MAX_MTU];

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let received = match socket.recv(&mut pkt) {
            Ok(received) => received,
            Err(err) if is_timeout(&err) || is_transient(&err) => continue,
            Err(err) => {
                logger::error(format!("receive failed on IOL bridge '{name}': {err}"));
                break;
            }
        };

        if logger::trace_enabled(TraceFlags::FORWARD) {
            logger::trace(
                TraceFlags::FORWARD,
                format!("received {received} bytes from IOL instance on IOL bridge '{name}'"),
            );
            logger::hex_dump(&pkt[..received]);
        }

        if received <= IOL_HDR_SIZE {
            continue;
        }
        let key = pkt[IOL_DST_PORT_OFFSET] as usize;
        let shared = {
            let guard = ports.lock();
            guard[key].as_ref().map(|entry| entry.shared.clone())
        };
        // Nothing attached to that port yet: silently drop.
        let Some(shared) = shared else { continue };

        let payload = &mut pkt[IOL_HDR_SIZE..received];
        let chain = shared.filters.lock().snapshot();
        if !chain.is_empty() {
            if let Some(filter) = run_chain(&chain, payload) {
                logger::trace(
                    TraceFlags::FILTER,
                    format!(
                        "packet dropped by packet filter '{}' from IOL instance on IOL bridge '{name}'",
                        filter.name()
                    ),
                );
                continue;
            }
        }
        if let Some(sink) = shared.capture.lock().as_mut() {
            sink.write(payload);
        }

        match shared.nio.send(payload) {
            Ok(sent) => shared.nio.stats().record_out(sent),
            Err(err) if is_transient(&err) || is_timeout(&err) => continue,
            Err(err) => {
                logger::error(format!("send failed on IOL bridge '{name}': {err}"));
                break;
            }
        }
    }
}

fn spawn_port_listener(shared: Arc<IolPortShared>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!(
            "iol-{}-port-{}-{}",
            shared.bridge_name, shared.bay, shared.unit
        ))
        .spawn(move || {
            logger::info(format!(
                "listener thread for IOL instance {} on port {}/{} has started",
                shared.iol_id, shared.bay, shared.unit
            ));
            port_listener(&shared);
            logger::info(format!(
                "listener thread for IOL instance {} on port {}/{} has stopped",
                shared.iol_id, shared.bay, shared.unit
            ));
        })
}

/// Reads from the port's external NIO, prefixes the precomputed header and
/// emits the frame to the peer instance's socket on the backplane.
fn port_listener(shared: &IolPortShared) {
    let mut pkt = vec![0u8; IOL_HDR_SIZE + MAX_MTU];

    loop {
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }
        let received = match shared.nio.recv(&mut pkt[IOL_HDR_SIZE..]) {
            Ok(received) => received,
            Err(err) if is_timeout(&err) || is_transient(&err) => continue,
            Err(err) => {
                logger::error(format!(
                    "receive failed on IOL bridge '{}' port {}/{}: {err}",
                    shared.bridge_name, shared.bay, shared.unit
                ));
                break;
            }
        };

        if received > MAX_MTU {
            logger::warn(format!(
                "received frame is {received} bytes (maximum is {MAX_MTU} bytes)"
            ));
            continue;
        }
        shared.nio.stats().record_in(received);

        if logger::trace_enabled(TraceFlags::FORWARD) {
            logger::trace(
                TraceFlags::FORWARD,
                format!(
                    "received {received} bytes from destination NIO on IOL bridge '{}'",
                    shared.bridge_name
                ),
            );
            logger::hex_dump(&pkt[IOL_HDR_SIZE..IOL_HDR_SIZE + received]);
        }

        let payload = &mut pkt[IOL_HDR_SIZE..IOL_HDR_SIZE + received];
        let chain = shared.filters.lock().snapshot();
        if !chain.is_empty() {
            if let Some(filter) = run_chain(&chain, payload) {
                logger::trace(
                    TraceFlags::FILTER,
                    format!(
                        "packet dropped by packet filter '{}' from destination NIO on IOL bridge '{}'",
                        filter.name(),
                        shared.bridge_name
                    ),
                );
                continue;
            }
        }
        if let Some(sink) = shared.capture.lock().as_mut() {
            sink.write(payload);
        }

        pkt[..IOL_HDR_SIZE].copy_from_slice(&shared.header);
        match shared
            .backplane
            .send_to(&pkt[..IOL_HDR_SIZE + received], &shared.peer_path)
        {
            Ok(_) => {}
            Err(err)
                if is_transient(&err)
                    || is_timeout(&err)
                    // The peer instance has not bound its socket yet.
                    || err.raw_os_error() == Some(libc::ENOENT) =>
            {
                continue
            }
            Err(err) => {
                logger::error(format!(
                    "send failed on IOL bridge '{}' port {}/{}: {err}",
                    shared.bridge_name, shared.bay, shared.unit
                ));
                break;
            }
        }
    }
}
