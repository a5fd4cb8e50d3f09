//! The per-direction forwarding loop: receive, filter, capture, send.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::capture::CaptureSink;
use crate::filter::{run_chain, FilterChain};
use crate::logger::{self, TraceFlags};
use crate::nio::{is_timeout, is_transient, Nio};
use crate::MAX_FRAME_SIZE;

pub(crate) struct ForwarderHalf {
    pub bridge_name: String,
    pub label: &'static str,
    pub rx: Arc<Nio>,
    pub tx: Arc<Nio>,
    pub filters: Arc<Mutex<FilterChain>>,
    pub capture: Arc<Mutex<Option<CaptureSink>>>,
    pub stop: Arc<AtomicBool>,
}

pub(crate) fn spawn(half: ForwarderHalf) -> io::Result<JoinHandle<()>> {
    let thread_name = format!("bridge-{}-{}", half.bridge_name, half.label);
    thread::Builder::new().name(thread_name).spawn(move || {
        logger::info(format!(
            "{} listener thread for {} has started",
            half.label, half.bridge_name
        ));
        forward(&half);
        logger::info(format!(
            "{} listener thread for {} has stopped",
            half.label, half.bridge_name
        ));
    })
}

fn forward(half: &ForwarderHalf) {
    let mut frame = vec![0u8; MAX_FRAME_SIZE];

    loop {
        if half.stop.load(Ordering::Relaxed) {
            break;
        }

        let received = match half.rx.recv(&mut frame) {
            Ok(received) => received,
            Err(err) if is_timeout(&err) || is_transient(&err) => continue,
            Err(err) => {
                logger::error(format!(
                    "receive failed on bridge '{}' ({}): {err}",
                    half.bridge_name, half.label
                ));
                break;
            }
        };

        if received > frame.len() {
            logger::warn(format!(
                "received frame is {received} bytes (maximum is {MAX_FRAME_SIZE} bytes)"
            ));
            continue;
        }

        half.rx.stats().record_in(received);
        if logger::trace_enabled(TraceFlags::FORWARD) {
            logger::trace(
                TraceFlags::FORWARD,
                format!(
                    "received {received} bytes on bridge '{}' ({})",
                    half.bridge_name, half.label
                ),
            );
            logger::hex_dump(&frame[..received]);
        }

        // Snapshot under a short lock; filter work (delay sleeps!) runs
        // without it so the control plane never blocks behind a filter.
        let chain = half.filters.lock().snapshot();
        if !chain.is_empty() {
            if let Some(filter) = run_chain(&chain, &mut frame[..received]) {
                logger::trace(
                    TraceFlags::FILTER,
                    format!(
                        "packet dropped by packet filter '{}' on bridge '{}'",
                        filter.name(),
                        half.bridge_name
                    ),
                );
                continue;
            }
        }

        if let Some(sink) = half.capture.lock().as_mut() {
            sink.write(&frame[..received]);
        }

        match half.tx.send(&frame[..received]) {
            Ok(sent) => half.tx.stats().record_out(sent),
            Err(err) if is_transient(&err) => continue,
            // The TAP driver reports EIO while the device is down; not an
            // error from the bridge's point of view.
            Err(err) if half.tx.is_tap() && err.raw_os_error() == Some(libc::EIO) => continue,
            Err(err) if is_timeout(&err) => continue,
            Err(err) => {
                logger::error(format!(
                    "send failed on bridge '{}' ({}): {err}",
                    half.bridge_name, half.label
                ));
                break;
            }
        }
    }
}
