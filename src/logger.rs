//! Process-wide logger. Plain messages carry a severity level; per-packet
//! tracing is routed through category flags so the hot path stays silent
//! unless a debug level was requested on the command line.

use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::io::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn trace(flag: TraceFlags, message: impl Into<String>) {
    LOGGER.trace(flag, message.into());
}

/// Maps the CLI `-d <level>` to a trace mask: level 1 enables packet-level
/// messages, level 2 additionally enables frame hex dumps.
pub fn set_debug_level(level: u8) {
    let mask = match level {
        0 => TraceFlags::empty(),
        1 => TraceFlags::FORWARD | TraceFlags::FILTER | TraceFlags::CAPTURE | TraceFlags::CONTROL,
        _ => TraceFlags::all(),
    };
    LOGGER.set_trace_mask(mask);
}

pub fn trace_enabled(flag: TraceFlags) -> bool {
    LOGGER.trace_mask().intersects(flag)
}

/// Hex dump of a frame, 16 bytes per row, emitted at trace level when the
/// HEXDUMP category is enabled.
pub fn hex_dump(frame: &[u8]) {
    if !trace_enabled(TraceFlags::HEXDUMP) {
        return;
    }
    let mut out = String::with_capacity(frame.len() * 4);
    for (row, chunk) in frame.chunks(16).enumerate() {
        let _ = write!(out, "\n{:04x}: ", row * 16);
        for byte in chunk {
            let _ = write!(out, "{byte:02x} ");
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        for byte in chunk {
            let c = *byte as char;
            out.push(if c.is_ascii_alphanumeric() { c } else { '.' });
        }
    }
    LOGGER.trace(TraceFlags::HEXDUMP, out);
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TraceFlags: u32 {
        const FORWARD = 0b0000_0001;
        const FILTER  = 0b0000_0010;
        const CAPTURE = 0b0000_0100;
        const CONTROL = 0b0000_1000;
        const HEXDUMP = 0b0001_0000;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

struct LogState {
    min_level: LogLevel,
    trace_mask: TraceFlags,
}

struct LogManager {
    state: Mutex<LogState>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            state: Mutex::new(LogState {
                min_level: LogLevel::Info,
                trace_mask: TraceFlags::empty(),
            }),
            prefix: format!("[netbridge-p{pid}]"),
        }
    }

    fn set_trace_mask(&self, mask: TraceFlags) {
        let mut state = self.state.lock();
        state.trace_mask = mask;
        if !mask.is_empty() {
            state.min_level = LogLevel::Debug;
        }
    }

    fn trace_mask(&self) -> TraceFlags {
        self.state.lock().trace_mask
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        if level > self.state.lock().min_level {
            return;
        }
        self.emit(level, None, &message);
    }

    fn trace(&self, flag: TraceFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        if !self.state.lock().trace_mask.intersects(flag) {
            return;
        }
        self.emit(LogLevel::Debug, Some(label_for(flag)), &message);
    }

    fn emit(&self, level: LogLevel, label: Option<&str>, message: &str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = match label {
            Some(label) => writeln!(
                out,
                "{} {}.{:03} {} [{}] {}",
                self.prefix,
                now.as_secs(),
                now.subsec_millis(),
                level.as_str(),
                label,
                message
            ),
            None => writeln!(
                out,
                "{} {}.{:03} {} {}",
                self.prefix,
                now.as_secs(),
                now.subsec_millis(),
                level.as_str(),
                message
            ),
        };
    }
}

fn label_for(flags: TraceFlags) -> &'static str {
    if flags.contains(TraceFlags::FORWARD) {
        "FORWARD"
    } else if flags.contains(TraceFlags::FILTER) {
        "FILTER"
    } else if flags.contains(TraceFlags::CAPTURE) {
        "CAPTURE"
    } else if flags.contains(TraceFlags::CONTROL) {
        "CONTROL"
    } else if flags.contains(TraceFlags::HEXDUMP) {
        "HEXDUMP"
    } else {
        "LOG"
    }
}
