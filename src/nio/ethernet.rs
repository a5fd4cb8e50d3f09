//! Physical Ethernet endpoint driven through libpcap. The capture handle
//! is shared by both forwarding directions, so calls go through a mutex;
//! the 10 ms kernel timeout keeps the receive side responsive to stop
//! flags while the lock is held.

use std::io;

use parking_lot::Mutex;
use pcap::{Active, Capture, Direction};

use super::NioError;
use crate::MAX_FRAME_SIZE;

// Kernel read timeout; also bounds how long recv holds the handle lock.
const READ_TIMEOUT_MS: i32 = 10;

pub struct EthernetNio {
    capture: Mutex<Capture<Active>>,
}

impl EthernetNio {
    pub fn new(device: &str) -> Result<Self, NioError> {
        let mut capture = Capture::from_device(device)?
            .promisc(true)
            .snaplen(MAX_FRAME_SIZE as i32)
            .timeout(READ_TIMEOUT_MS)
            .open()?;

        #[cfg(target_os = "macos")]
        capture.direction(Direction::In)?;
        #[cfg(not(target_os = "macos"))]
        capture.direction(Direction::InOut)?;

        // Feed sent packets back to the capture, otherwise self-originated
        // traffic is invisible on FreeBSD.
        #[cfg(target_os = "freebsd")]
        {
            use std::os::fd::AsRawFd;
            const BIOCFEEDBACK: libc::c_ulong = 0x8004427c;
            let on: libc::c_int = 1;
            // Safety: the capture owns a valid BPF descriptor.
            unsafe {
                libc::ioctl(capture.as_raw_fd(), BIOCFEEDBACK, &on);
            }
        }

        Ok(Self {
            capture: Mutex::new(capture),
        })
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let mut capture = self.capture.lock();
        capture
            .sendpacket(buf)
            .map_err(|err| io::Error::other(err.to_string()))?;
        Ok(buf.len())
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut capture = self.capture.lock();
        match capture.next_packet() {
            Ok(packet) => {
                let len = buf.len().min(packet.data.len());
                buf[..len].copy_from_slice(&packet.data[..len]);
                Ok(len)
            }
            Err(pcap::Error::TimeoutExpired) => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Err(err) => Err(io::Error::other(err.to_string())),
        }
    }

    pub fn set_filter(&self, expression: &str) -> Result<(), NioError> {
        let mut capture = self.capture.lock();
        capture.filter(expression, true)?;
        Ok(())
    }
}
