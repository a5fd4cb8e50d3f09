//! Per-frame packet filters. A bridge direction walks its chain in
//! insertion order and the first DROP verdict wins. Filter state is
//! shared by both directions, so mutable pieces are atomics or live
//! behind their own small locks.


use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use pcap::{BpfProgram, Capture, Linktype};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;
use thiserror::Error;

use crate::MAX_FRAME_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Pass,
    Drop,
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter type '{0}' doesn't exist")]
    UnknownType(String),
    #[error("filter '{0}' already exists")]
    DuplicateName(String),
    #[error("{0}")]
    InvalidParameter(String),
    #[error("cannot compile filter: {0}")]
    Bpf(#[from] pcap::Error),
}

// XOR pattern applied by the corrupt filter, cycled by a persistent cursor.
const CORRUPT_PATTERNS: [u8; 8] = [0x64, 0x13, 0x88, 0x40, 0x1F, 0xA0, 0xAA, 0x55];

/// Compiled BPF instructions. libpcap only ever reads the program when
/// matching, so sharing it between the two forwarder threads is sound.
struct CompiledBpf(BpfProgram);

unsafe impl Send for CompiledBpf {}
unsafe impl Sync for CompiledBpf {}

impl std::fmt::Debug for CompiledBpf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledBpf").finish()
    }
}

#[derive(Debug)]
enum FilterKind {
    FrequencyDrop {
        frequency: i64,
        current: AtomicI64,
    },
    PacketLoss {
        percentage: u8,
        rng: Mutex<SmallRng>,
    },
    Delay {
        latency_ms: u64,
        jitter_ms: u64,
        rng: Mutex<SmallRng>,
    },
    Corrupt {
        percentage: u8,
        cursor: AtomicUsize,
        rng: Mutex<SmallRng>,
    },
    Bpf {
        program: CompiledBpf,
    },
}

#[derive(Debug)]
pub struct PacketFilter {
    name: String,
    type_name: &'static str,
    kind: FilterKind,
}

impl PacketFilter {
    pub fn new(name: &str, filter_type: &str, args: &[String]) -> Result<Self, FilterError> {
        Self::with_seed(name, filter_type, args, next_seed())
    }

    /// Like [`PacketFilter::new`] but with an explicit RNG seed, for
    /// reproducible behavior in tests.
    pub fn with_seed(
        name: &str,
        filter_type: &str,
        args: &[String],
        seed: u64,
    ) -> Result<Self, FilterError> {
        let (type_name, kind) = match filter_type {
            "frequency_drop" => {
                let frequency = parse_one::<i64>(args, "frequency")?;
                (
                    "frequency_drop",
                    FilterKind::FrequencyDrop {
                        frequency,
                        current: AtomicI64::new(0),
                    },
                )
            }
            "packet_loss" => (
                "packet_loss",
                FilterKind::PacketLoss {
                    percentage: parse_percentage(args)?,
                    rng: Mutex::new(SmallRng::seed_from_u64(seed)),
                },
            ),
            "delay" => {
                if args.is_empty() || args.len() > 2 {
                    return Err(FilterError::InvalidParameter(
                        "delay takes a latency and an optional jitter".to_owned(),
                    ));
                }
                let latency_ms = args[0].parse::<i64>().map_err(|_| {
                    FilterError::InvalidParameter(format!("invalid latency '{}'", args[0]))
                })?;
                let jitter_ms = match args.get(1) {
                    Some(arg) => arg.parse::<i64>().map_err(|_| {
                        FilterError::InvalidParameter(format!("invalid jitter '{arg}'"))
                    })?,
                    None => 0,
                };
                if latency_ms <= 0 || jitter_ms < 0 {
                    return Err(FilterError::InvalidParameter(
                        "latency must be > 0 and jitter >= 0".to_owned(),
                    ));
                }
                (
                    "delay",
                    FilterKind::Delay {
                        latency_ms: latency_ms as u64,
                        jitter_ms: jitter_ms as u64,
                        rng: Mutex::new(SmallRng::seed_from_u64(seed)),
                    },
                )
            }
            "corrupt" => (
                "corrupt",
                FilterKind::Corrupt {
                    percentage: parse_percentage(args)?,
                    cursor: AtomicUsize::new(0),
                    rng: Mutex::new(SmallRng::seed_from_u64(seed)),
                },
            ),
            "bpf" => {
                if args.is_empty() || args.len() > 2 {
                    return Err(FilterError::InvalidParameter(
                        "bpf takes an expression and an optional link type".to_owned(),
                    ));
                }
                let linktype = match args.get(1) {
                    Some(name) => Linktype::from_name(name).map_err(|_| {
                        FilterError::InvalidParameter(format!("unknown link type {name}"))
                    })?,
                    None => Linktype::ETHERNET,
                };
                let dead = Capture::dead(linktype)?;
                let program = dead.compile(&args[0], true)?;
                (
                    "bpf",
                    FilterKind::Bpf {
                        program: CompiledBpf(program),
                    },
                )
            }
            other => return Err(FilterError::UnknownType(other.to_owned())),
        };

        Ok(Self {
            name: name.to_owned(),
            type_name,
            kind,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn apply(&self, frame: &mut [u8]) -> FilterAction {
        match &self.kind {
            FilterKind::FrequencyDrop { frequency, current } => match *frequency {
                -1 => FilterAction::Drop,
                0 => FilterAction::Pass,
                frequency => {
                    let count = current.fetch_add(1, Ordering::Relaxed) + 1;
                    if count == frequency {
                        current.store(0, Ordering::Relaxed);
                        FilterAction::Drop
                    } else {
                        FilterAction::Pass
                    }
                }
            },
            FilterKind::PacketLoss { percentage, rng } => {
                if rng.lock().gen_range(0..100u8) < *percentage {
                    FilterAction::Drop
                } else {
                    FilterAction::Pass
                }
            }
            FilterKind::Delay {
                latency_ms,
                jitter_ms,
                rng,
            } => {
                let mut delay = *latency_ms as i64;
                if *jitter_ms > 0 {
                    let jitter = rng.lock().gen_range(0..=2 * *jitter_ms) as i64;
                    delay = delay - *jitter_ms as i64 + jitter;
                }
                if delay > 0 {
                    thread::sleep(Duration::from_millis(delay as u64));
                }
                FilterAction::Pass
            }
            FilterKind::Corrupt {
                percentage,
                cursor,
                rng,
            } => {
                if rng.lock().gen_range(0..100u8) < *percentage {
                    corrupt_middle_quarter(frame, cursor);
                }
                FilterAction::Pass
            }
            FilterKind::Bpf { program } => {
                if program.0.filter(frame) {
                    FilterAction::Drop
                } else {
                    FilterAction::Pass
                }
            }
        }
    }
}

/// XORs the middle quarter of the frame against the fixed pattern table,
/// advancing the persistent cursor one pattern byte per corrupted byte.
fn corrupt_middle_quarter(frame: &mut [u8], cursor: &AtomicUsize) {
    let length = frame.len() / 4;
    if length == 0 {
        return;
    }
    let start = frame.len() / 2 - length / 2 + 1;
    let end = (start + length).min(frame.len());
    let mut index = cursor.load(Ordering::Relaxed);
    for byte in &mut frame[start..end] {
        *byte ^= CORRUPT_PATTERNS[index & 0x7];
        index += 1;
    }
    cursor.store(index, Ordering::Relaxed);
}

fn parse_one<T: std::str::FromStr>(args: &[String], what: &str) -> Result<T, FilterError> {
    if args.len() != 1 {
        return Err(FilterError::InvalidParameter(format!(
            "expected exactly one {what} argument"
        )));
    }
    args[0]
        .parse::<T>()
        .map_err(|_| FilterError::InvalidParameter(format!("invalid {what} '{}'", args[0])))
}

fn parse_percentage(args: &[String]) -> Result<u8, FilterError> {
    let percentage = parse_one::<i64>(args, "percentage")?;
    if !(0..=100).contains(&percentage) {
        return Err(FilterError::InvalidParameter(format!(
            "percentage {percentage} out of range"
        )));
    }
    Ok(percentage as u8)
}

/// Insertion-ordered chain with unique names.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Arc<PacketFilter>>,
}

impl FilterChain {
    pub fn add(&mut self, filter: PacketFilter) -> Result<(), FilterError> {
        if self.filters.iter().any(|f| f.name() == filter.name()) {
            return Err(FilterError::DuplicateName(filter.name().to_owned()));
        }
        self.filters.push(Arc::new(filter));
        Ok(())
    }

    /// Removes the named filter, preserving the order of the rest.
    pub fn delete(&mut self, name: &str) -> bool {
        let before = self.filters.len();
        self.filters.retain(|f| f.name() != name);
        self.filters.len() != before
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(|f| f.name())
    }

    /// Cheap copy of the chain for a forwarder to walk without holding the
    /// chain lock across filter work (delay filters sleep).
    pub fn snapshot(&self) -> SmallVec<[Arc<PacketFilter>; 4]> {
        self.filters.iter().cloned().collect()
    }
}

/// Applies `chain` to `frame`; returns the filter that dropped it, if any.
/// Traversal stops at the first DROP.
pub fn run_chain(
    chain: &SmallVec<[Arc<PacketFilter>; 4]>,
    frame: &mut [u8],
) -> Option<Arc<PacketFilter>> {
    debug_assert!(frame.len() <= MAX_FRAME_SIZE);
    for filter in chain {
        if filter.apply(frame) == FilterAction::Drop {
            return Some(filter.clone());
        }
    }
    None
}

static SEED_COUNTER: AtomicU64 = AtomicU64::new(0);
static BASE_SEED: Lazy<u64> = Lazy::new(|| {
    std::env::var("NETBRIDGE_SEED")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or_else(rand::random)
});

fn next_seed() -> u64 {
    BASE_SEED.wrapping_add(SEED_COUNTER.fetch_add(1, Ordering::Relaxed))
}
