//! UDP tunnel endpoint: bound to a local port, connected to the remote
//! peer so the kernel filters ingress to that peer.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use super::{NioError, RECV_POLL_TIMEOUT};
use crate::logger;

pub struct UdpNio {
    socket: UdpSocket,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
}

impl UdpNio {
    /// Resolves all candidate addresses for the remote peer and keeps the
    /// first one that both binds locally and connects.
    pub fn new(local_port: u16, remote_host: &str, remote_port: u16) -> Result<Self, NioError> {
        let candidates = (remote_host, remote_port).to_socket_addrs()?;
        let mut last_err: Option<io::Error> = None;

        for remote in candidates {
            let local: SocketAddr = match remote {
                SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, local_port).into(),
                SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, local_port).into(),
            };
            let socket = match UdpSocket::bind(local) {
                Ok(socket) => socket,
                Err(err) => {
                    last_err = Some(err);
                    continue;
                }
            };
            if let Err(err) = socket.connect(remote) {
                last_err = Some(err);
                continue;
            }
            socket.set_read_timeout(Some(RECV_POLL_TIMEOUT))?;
            logger::info(format!(
                "UDP tunnel connecting from local port {local_port} to {remote} (IPv{})",
                if remote.is_ipv6() { 6 } else { 4 }
            ));
            return Ok(Self {
                socket,
                local_port,
                remote_host: remote_host.to_owned(),
                remote_port,
            });
        }

        Err(match last_err {
            Some(err) => NioError::Io(err),
            None => NioError::InvalidParameter(format!(
                "no usable address for {remote_host}:{remote_port}"
            )),
        })
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    pub fn endpoints(&self) -> (u16, &str, u16) {
        (self.local_port, &self.remote_host, self.remote_port)
    }

    /// Actual bound port, useful when constructed with port 0.
    pub fn local_port(&self) -> u16 {
        self.socket
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.local_port)
    }
}
