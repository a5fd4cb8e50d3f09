//! Packet capture sink. Frames observed by a forwarder are appended to a
//! tcpdump-format file through a dead pcap handle; the slot holding the
//! sink is mutex-guarded, which serializes dumps from the two directions.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use pcap::{Capture, Dead, Linktype, Packet, PacketHeader, Savefile};
use thiserror::Error;

use crate::logger;
use crate::MAX_FRAME_SIZE;

pub const DEFAULT_LINKTYPE: &str = "EN10MB";

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("pcap: {0}")]
    Pcap(#[from] pcap::Error),
}

pub struct CaptureSink {
    // Declared before the dead handle so the dumper closes first.
    dumper: Savefile,
    _dead: Capture<Dead>,
    snaplen: usize,
}

impl CaptureSink {
    /// Opens `path` for writing with the named link type; unknown names
    /// fall back to Ethernet with a warning.
    pub fn create(path: &Path, linktype_name: &str) -> Result<Self, CaptureError> {
        let linktype = Linktype::from_name(linktype_name).unwrap_or_else(|_| {
            logger::warn(format!(
                "unknown link type {linktype_name}, assuming Ethernet"
            ));
            Linktype::ETHERNET
        });
        let dead = Capture::dead(linktype)?;
        let dumper = dead.savefile(path)?;
        logger::info(format!("capturing to file '{}'", path.display()));
        Ok(Self {
            dumper,
            _dead: dead,
            snaplen: MAX_FRAME_SIZE,
        })
    }

    /// Appends one frame and flushes so partially written captures stay
    /// readable while the bridge keeps running.
    pub fn write(&mut self, frame: &[u8]) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let header = PacketHeader {
            ts: libc::timeval {
                tv_sec: now.as_secs() as libc::time_t,
                tv_usec: now.subsec_micros() as libc::suseconds_t,
            },
            caplen: frame.len().min(self.snaplen) as u32,
            len: frame.len() as u32,
        };
        let caplen = header.caplen as usize;
        self.dumper.write(&Packet::new(&header, &frame[..caplen]));
        if let Err(err) = self.dumper.flush() {
            logger::warn(format!("capture flush failed: {err}"));
        }
    }
}
