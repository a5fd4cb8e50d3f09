//! Line-oriented TCP control plane. Clients send `<module> <command>
//! [arg...]` requests; every reply line starts with a 3-digit status code
//! followed by `-` on continuation lines or a space on the final line.
//! Command handlers run under the process-wide registry mutex.

mod bridge;
#[cfg(target_os = "linux")]
mod brctl;
#[cfg(target_os = "linux")]
mod docker;
#[cfg(target_os = "linux")]
mod iol;
pub mod parser;

#[cfg(test)]
mod tests;

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context as _;

use crate::logger::{self, TraceFlags};
use crate::registry::{Registry, SharedRegistry};
use crate::VERSION;

pub const DEFAULT_TCP_PORT: u16 = 4242;

// Accept-loop poll interval; also bounds how fast dead connections are
// reaped and the shutdown flag is observed.
const ACCEPT_POLL_MS: libc::c_int = 500;
const MAX_LINE_LEN: usize = 512;

pub mod status {
    pub const INFO_OK: u16 = 100;
    pub const INFO_MSG: u16 = 101;
    pub const INFO_DEBUG: u16 = 102;
    pub const ERR_PARSING: u16 = 200;
    pub const ERR_UNK_MODULE: u16 = 201;
    pub const ERR_UNK_CMD: u16 = 202;
    pub const ERR_BAD_PARAM: u16 = 203;
    pub const ERR_INV_PARAM: u16 = 204;
    pub const ERR_BINDING: u16 = 205;
    pub const ERR_CREATE: u16 = 206;
    pub const ERR_DELETE: u16 = 207;
    pub const ERR_UNK_OBJ: u16 = 208;
    pub const ERR_START: u16 = 209;
    pub const ERR_STOP: u16 = 210;
    pub const ERR_FILE: u16 = 211;
    pub const ERR_BAD_OBJ: u16 = 212;
    pub const ERR_RENAME: u16 = 213;
    pub const ERR_NOT_FOUND: u16 = 214;
    pub const ERR_UNSPECIFIED: u16 = 215;
}

/// One connected control client; handlers reply through it.
pub struct Connection {
    stream: TcpStream,
    active: bool,
    server_shutdown: Arc<AtomicBool>,
}

impl Connection {
    /// Sends one reply line. `last` selects the terminal separator (space)
    /// over the continuation one (`-`).
    pub fn send_reply(&mut self, code: u16, last: bool, message: impl AsRef<str>) {
        let separator = if last { ' ' } else { '-' };
        let line = format!("{code:03}{separator}{}\r\n", message.as_ref());
        if self.stream.write_all(line.as_bytes()).is_err() {
            self.active = false;
        }
    }

    pub fn close(&mut self) {
        self.active = false;
    }

    pub fn request_server_shutdown(&self) {
        self.server_shutdown.store(true, Ordering::SeqCst);
    }
}

pub type CmdHandler = fn(&mut Connection, &mut Registry, &[String]);

pub struct Command {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    pub handler: CmdHandler,
}

pub struct Module {
    pub name: &'static str,
    pub commands: &'static [Command],
}

static HYPERVISOR_COMMANDS: &[Command] = &[
    Command {
        name: "version",
        min_args: 0,
        max_args: 0,
        handler: cmd_version,
    },
    Command {
        name: "module_list",
        min_args: 0,
        max_args: 0,
        handler: cmd_module_list,
    },
    Command {
        name: "cmd_list",
        min_args: 1,
        max_args: 1,
        handler: cmd_cmd_list,
    },
    Command {
        name: "reset",
        min_args: 0,
        max_args: 0,
        handler: cmd_reset,
    },
    Command {
        name: "close",
        min_args: 0,
        max_args: 0,
        handler: cmd_close,
    },
    Command {
        name: "stop",
        min_args: 0,
        max_args: 0,
        handler: cmd_stop,
    },
];

/// All registered modules. Assembled once at first use; read concurrently
/// by every connection thread, never mutated afterwards.
pub fn modules() -> &'static [Module] {
    static MODULES: once_cell::sync::Lazy<Vec<Module>> = once_cell::sync::Lazy::new(|| {
        let mut modules = vec![
            Module {
                name: "hypervisor",
                commands: HYPERVISOR_COMMANDS,
            },
            Module {
                name: "bridge",
                commands: bridge::commands(),
            },
        ];
        #[cfg(target_os = "linux")]
        {
            modules.push(Module {
                name: "iol_bridge",
                commands: iol::COMMANDS,
            });
            modules.push(Module {
                name: "docker",
                commands: docker::COMMANDS,
            });
            modules.push(Module {
                name: "brctl",
                commands: brctl::COMMANDS,
            });
        }
        modules
    });
    &MODULES
}

fn find_module(name: &str) -> Option<&'static Module> {
    modules().iter().find(|module| module.name == name)
}

fn cmd_version(conn: &mut Connection, _registry: &mut Registry, _args: &[String]) {
    conn.send_reply(status::INFO_OK, true, VERSION);
}

fn cmd_module_list(conn: &mut Connection, _registry: &mut Registry, _args: &[String]) {
    for module in modules() {
        conn.send_reply(status::INFO_MSG, false, module.name);
    }
    conn.send_reply(status::INFO_OK, true, "OK");
}

fn cmd_cmd_list(conn: &mut Connection, _registry: &mut Registry, args: &[String]) {
    let Some(module) = find_module(&args[0]) else {
        conn.send_reply(
            status::ERR_UNK_MODULE,
            true,
            format!("unknown module '{}'", args[0]),
        );
        return;
    };
    for command in module.commands {
        conn.send_reply(
            status::INFO_MSG,
            false,
            format!(
                "{} (min/max args: {}/{})",
                command.name, command.min_args, command.max_args
            ),
        );
    }
    conn.send_reply(status::INFO_OK, true, "OK");
}

fn cmd_reset(conn: &mut Connection, registry: &mut Registry, _args: &[String]) {
    registry.reset();
    conn.send_reply(status::INFO_OK, true, "OK");
}

fn cmd_close(conn: &mut Connection, _registry: &mut Registry, _args: &[String]) {
    conn.send_reply(status::INFO_OK, true, "OK");
    conn.close();
}

fn cmd_stop(conn: &mut Connection, _registry: &mut Registry, _args: &[String]) {
    conn.send_reply(status::INFO_OK, true, "OK");
    conn.request_server_shutdown();
}

/// Parses one argument, replying 204 and returning None on failure.
pub(crate) fn parse_arg<T: FromStr>(conn: &mut Connection, value: &str, what: &str) -> Option<T> {
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            conn.send_reply(
                status::ERR_INV_PARAM,
                true,
                format!("invalid {what} '{value}'"),
            );
            None
        }
    }
}

fn handle_line(conn: &mut Connection, registry: &SharedRegistry, line: &str) {
    logger::trace(TraceFlags::CONTROL, format!("request: {line}"));

    let tokens = match parser::tokenize(line) {
        Ok(tokens) => tokens,
        Err(err) => {
            conn.send_reply(status::ERR_PARSING, true, format!("parse error: {err}"));
            return;
        }
    };
    if tokens.is_empty() {
        return;
    }
    if tokens.len() < 2 {
        conn.send_reply(
            status::ERR_PARSING,
            true,
            "at least a module and a command must be specified",
        );
        return;
    }

    let Some(module) = find_module(&tokens[0]) else {
        conn.send_reply(
            status::ERR_UNK_MODULE,
            true,
            format!("unknown module '{}'", tokens[0]),
        );
        return;
    };
    let Some(command) = module.commands.iter().find(|cmd| cmd.name == tokens[1]) else {
        conn.send_reply(
            status::ERR_UNK_CMD,
            true,
            format!("unknown command '{}'", tokens[1]),
        );
        return;
    };

    let args = &tokens[2..];
    if args.len() < command.min_args || args.len() > command.max_args {
        conn.send_reply(
            status::ERR_BAD_PARAM,
            true,
            format!(
                "bad number of parameters ({} with min/max={}/{})",
                args.len(),
                command.min_args,
                command.max_args
            ),
        );
        return;
    }

    let mut registry = registry.lock();
    (command.handler)(conn, &mut registry, args);
}

fn serve_connection(
    stream: TcpStream,
    registry: SharedRegistry,
    server_shutdown: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
) {
    let reader = match stream.try_clone() {
        Ok(clone) => BufReader::new(clone),
        Err(err) => {
            logger::error(format!("cannot clone control connection: {err}"));
            done.store(true, Ordering::SeqCst);
            return;
        }
    };
    let mut conn = Connection {
        stream,
        active: true,
        server_shutdown,
    };

    let mut line = String::with_capacity(MAX_LINE_LEN);
    let mut reader = reader.take(MAX_LINE_LEN as u64);
    while conn.active {
        line.clear();
        // Refresh the per-line quota.
        reader.set_limit(MAX_LINE_LEN as u64);
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => handle_line(&mut conn, &registry, line.trim_end_matches(['\r', '\n'])),
            Err(_) => break,
        }
    }

    let _ = conn.stream.shutdown(Shutdown::Both);
    done.store(true, Ordering::SeqCst);
}

struct ConnHandle {
    stream: TcpStream,
    done: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

pub struct Server {
    listeners: Vec<TcpListener>,
    registry: SharedRegistry,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Binds every IPv4/IPv6 address matching `bind_addr` (all-any when
    /// absent) on `port`. At least one listener must succeed.
    pub fn bind(
        registry: SharedRegistry,
        bind_addr: Option<&str>,
        port: u16,
    ) -> anyhow::Result<Self> {
        let candidates: Vec<SocketAddr> = match bind_addr {
            Some(addr) if !addr.is_empty() => (addr, port)
                .to_socket_addrs()
                .with_context(|| format!("cannot resolve bind address '{addr}'"))?
                .collect(),
            _ => vec![
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
                SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
            ],
        };

        let mut listeners = Vec::new();
        for candidate in candidates {
            match TcpListener::bind(candidate) {
                Ok(listener) => {
                    listener
                        .set_nonblocking(true)
                        .context("cannot make control socket non-blocking")?;
                    listeners.push(listener);
                }
                // Dual-stack kernels make the second wildcard bind fail;
                // one listening socket is all we need.
                Err(err) => logger::debug(format!("control bind {candidate} failed: {err}")),
            }
        }
        if listeners.is_empty() {
            anyhow::bail!("hypervisor: unable to create TCP sockets");
        }

        Ok(Self {
            listeners,
            registry,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    /// Accept loop. Returns when the `stop` command arrives or
    /// `external_stop` reports true (the signal handlers' flag).
    pub fn run<F: Fn() -> bool>(self, external_stop: F) {
        logger::info("hypervisor TCP control server started".to_owned());

        let mut connections: Vec<ConnHandle> = Vec::new();
        while !self.shutdown.load(Ordering::SeqCst) && !external_stop() {
            let mut fds: Vec<libc::pollfd> = self
                .listeners
                .iter()
                .map(|listener| libc::pollfd {
                    fd: listener.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();
            // Safety: fds points to valid pollfds for the duration of the call.
            let ready = unsafe {
                libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ACCEPT_POLL_MS)
            };
            if ready < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                logger::error(format!("hypervisor: poll failed: {err}"));
                break;
            }

            for (listener, pfd) in self.listeners.iter().zip(&fds) {
                if pfd.revents & libc::POLLIN == 0 {
                    continue;
                }
                loop {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            logger::trace(
                                TraceFlags::CONTROL,
                                format!("new control connection from {peer}"),
                            );
                            if let Some(handle) = self.spawn_connection(stream) {
                                connections.push(handle);
                            }
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            logger::error(format!("hypervisor: accept failed: {err}"));
                            break;
                        }
                    }
                }
            }

            // Reap connections whose threads have finished.
            connections.retain_mut(|handle| {
                if handle.done.load(Ordering::SeqCst) {
                    if let Some(worker) = handle.worker.take() {
                        let _ = worker.join();
                    }
                    false
                } else {
                    true
                }
            });
        }

        logger::info("hypervisor: closing remote client connections".to_owned());
        for mut handle in connections {
            let _ = handle.stream.shutdown(Shutdown::Both);
            if let Some(worker) = handle.worker.take() {
                let _ = worker.join();
            }
        }
        logger::info("hypervisor: stopped".to_owned());
    }

    fn spawn_connection(&self, stream: TcpStream) -> Option<ConnHandle> {
        // The accept loop left the listener non-blocking; the stream must
        // block on reads again.
        if stream.set_nonblocking(false).is_err() {
            return None;
        }
        let reaper_stream = match stream.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                logger::error(format!("cannot clone control connection: {err}"));
                return None;
            }
        };
        let done = Arc::new(AtomicBool::new(false));
        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        let thread_done = done.clone();
        let worker = thread::Builder::new()
            .name("hypervisor-conn".to_owned())
            .spawn(move || serve_connection(stream, registry, shutdown, thread_done))
            .ok()?;
        Some(ConnHandle {
            stream: reaper_stream,
            done,
            worker: Some(worker),
        })
    }
}
