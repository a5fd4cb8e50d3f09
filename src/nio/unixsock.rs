//! UNIX-domain datagram endpoint. The local socket file is owned by this
//! endpoint and removed again on destruction.

use std::fs;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;

use super::{NioError, RECV_POLL_TIMEOUT};

// sockaddr_un.sun_path limit, NUL included.
const MAX_PATH_LEN: usize = 108;

pub struct UnixNio {
    socket: UnixDatagram,
    local_path: PathBuf,
    remote_path: PathBuf,
}

impl UnixNio {
    pub fn new(local_path: &str, remote_path: &str) -> Result<Self, NioError> {
        if local_path.len() >= MAX_PATH_LEN || remote_path.len() >= MAX_PATH_LEN {
            return Err(NioError::InvalidParameter(
                "UNIX socket path too long".to_owned(),
            ));
        }

        // A previous instance may have left its socket file behind.
        let _ = fs::remove_file(local_path);
        let socket = UnixDatagram::bind(local_path)?;
        socket.set_read_timeout(Some(RECV_POLL_TIMEOUT))?;
        Ok(Self {
            socket,
            local_path: PathBuf::from(local_path),
            remote_path: PathBuf::from(remote_path),
        })
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send_to(buf, &self.remote_path)
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }
}

impl Drop for UnixNio {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.local_path);
    }
}
