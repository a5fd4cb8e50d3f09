#![deny(unsafe_op_in_unsafe_fn)]

//! User-space L2 frame forwarder. Each bridge pairs two network I/O
//! endpoints (NIOs) and copies frames between them bidirectionally; a TCP
//! line-oriented control plane ("hypervisor") creates, inspects and
//! reconfigures bridges at runtime.

pub mod bridge;
pub mod capture;
pub mod config;
pub mod filter;
pub mod hypervisor;
#[cfg(target_os = "linux")]
pub mod iol;
pub mod logger;
#[cfg(target_os = "linux")]
mod netlink;
pub mod nio;
pub mod registry;

pub const NAME: &str = "netbridge";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest frame the forwarder will carry, matching the pcap snap length.
pub const MAX_FRAME_SIZE: usize = 65535;
