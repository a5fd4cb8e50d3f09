//! Advisory lock proving exclusive ownership of an IOL backplane socket.
//! The lock file sits next to the socket as `<path>.lck` and carries the
//! holder's PID so contention can be reported across processes.

use std::io::{self, Write as _};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

fn lock_path_for(socket_path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.lck", socket_path.display()))
}

pub struct SocketLock {
    fd: OwnedFd,
    lock_path: PathBuf,
}

impl SocketLock {
    /// Takes a write lock on `<socket_path>.lck`, creating the file 0600 if
    /// absent, and records the caller's PID in it. Fails with
    /// `AddrInUse`-kind errors while another process holds the lock.
    pub fn acquire(socket_path: &Path) -> io::Result<Self> {
        let lock_path = lock_path_for(socket_path);
        let c_path = std::ffi::CString::new(lock_path.as_os_str().as_encoded_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        // Safety: c_path is a valid NUL-terminated string.
        let mut raw = unsafe { libc::open(c_path.as_ptr(), libc::O_WRONLY) };
        if raw < 0 && io::Error::last_os_error().kind() == io::ErrorKind::NotFound {
            // Safety: as above, with creation flags and 0600 mode.
            raw = unsafe {
                libc::open(
                    c_path.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY,
                    libc::S_IRUSR | libc::S_IWUSR,
                )
            };
        }
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: raw is a freshly opened, owned descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut fl: libc::flock = unsafe { mem::zeroed() };
        fl.l_type = libc::F_WRLCK as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        // Safety: fl is a valid flock describing a whole-file write lock.
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETLK, &fl) } < 0 {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }

        // The lock is ours; replace whatever PID a dead owner left behind.
        // Safety: truncating our own open descriptor.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), 0) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut file = std::fs::File::from(fd.try_clone()?);
        writeln!(file, "{}", std::process::id())?;

        Ok(Self { fd, lock_path })
    }

    /// PID of the process holding the lock for `socket_path`, if any.
    pub fn holder_pid(socket_path: &Path) -> Option<libc::pid_t> {
        let lock_path = lock_path_for(socket_path);
        let c_path = std::ffi::CString::new(lock_path.as_os_str().as_encoded_bytes()).ok()?;
        // Safety: c_path is a valid NUL-terminated string.
        let raw = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY) };
        if raw < 0 {
            return None;
        }
        // Safety: raw is a freshly opened, owned descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut fl: libc::flock = unsafe { mem::zeroed() };
        fl.l_type = libc::F_WRLCK as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        // Safety: fl is a valid flock for F_GETLK to fill in.
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETLK, &mut fl) } < 0 {
            return None;
        }
        if fl.l_type == libc::F_UNLCK as libc::c_short || fl.l_pid <= 0 {
            return None;
        }
        Some(fl.l_pid)
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for SocketLock {
    fn drop(&mut self) {
        // Unlink before the descriptor closes so a racing successor cannot
        // lose its fresh lock file to our cleanup.
        let _ = std::fs::remove_file(&self.lock_path);
    }
}
