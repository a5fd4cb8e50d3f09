use super::*;
use crate::nio::Nio;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A bridge wired between two external UDP sockets:
/// ext_a <-> source NIO | bridge | destination NIO <-> ext_b.
struct Harness {
    bridge: Bridge,
    ext_a: UdpSocket,
    ext_b: UdpSocket,
    bridge_port_a: u16,
}

impl Harness {
    fn new(name: &str) -> Self {
        let ext_a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let ext_b = UdpSocket::bind("127.0.0.1:0").unwrap();
        ext_a.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
        ext_b.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();

        let bridge_port_a = free_udp_port();
        let bridge_port_b = free_udp_port();

        let mut bridge = Bridge::new(name);
        bridge
            .add_nio(Nio::udp(bridge_port_a, "127.0.0.1", ext_a.local_addr().unwrap().port()).unwrap())
            .unwrap();
        bridge
            .add_nio(Nio::udp(bridge_port_b, "127.0.0.1", ext_b.local_addr().unwrap().port()).unwrap())
            .unwrap();

        Self {
            bridge,
            ext_a,
            ext_b,
            bridge_port_a,
        }
    }

    fn send_to_source(&self, payload: &[u8]) {
        self.ext_a
            .send_to(payload, ("127.0.0.1", self.bridge_port_a))
            .unwrap();
    }

    fn recv_from_destination(&self) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let (received, _) = self.ext_b.recv_from(&mut buf).unwrap();
        buf[..received].to_vec()
    }
}

fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn temp_pcap(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("netbridge-bridge-{}-{name}.pcap", std::process::id()))
}

#[test]
fn start_requires_both_nio_slots() {
    let mut bridge = Bridge::new("empty");
    assert!(matches!(bridge.start(), Err(BridgeError::MissingNios)));

    bridge
        .add_nio(Nio::udp(free_udp_port(), "127.0.0.1", free_udp_port()).unwrap())
        .unwrap();
    assert!(matches!(bridge.start(), Err(BridgeError::MissingNios)));
    assert_eq!(bridge.nio_count(), 1);
}

#[test]
fn third_nio_is_rejected() {
    let mut bridge = Bridge::new("full");
    for _ in 0..2 {
        bridge
            .add_nio(Nio::udp(free_udp_port(), "127.0.0.1", free_udp_port()).unwrap())
            .unwrap();
    }
    let extra = Nio::udp(free_udp_port(), "127.0.0.1", free_udp_port()).unwrap();
    assert!(matches!(
        bridge.add_nio(extra),
        Err(BridgeError::NioSlotsFull)
    ));
}

#[test]
fn forwards_frames_and_counts_them() {
    let mut harness = Harness::new("b1");
    harness.bridge.start().unwrap();
    assert!(harness.bridge.is_running());
    assert!(matches!(
        harness.bridge.start(),
        Err(BridgeError::AlreadyRunning)
    ));

    let payload = [0xABu8; 64];
    for _ in 0..10 {
        harness.send_to_source(&payload);
        assert_eq!(harness.recv_from_destination(), payload);
    }

    // The counters are bumped right after the send that delivered the last
    // datagram; give the worker a moment to get there.
    std::thread::sleep(Duration::from_millis(50));
    let source_stats = harness.bridge.source_nio().unwrap().stats().snapshot();
    let destination_stats = harness
        .bridge
        .destination_nio()
        .unwrap()
        .stats()
        .snapshot();
    assert_eq!(source_stats.packets_in, 10);
    assert_eq!(source_stats.bytes_in, 640);
    assert_eq!(destination_stats.packets_out, 10);
    assert_eq!(destination_stats.bytes_out, 640);

    harness.bridge.reset_stats();
    assert_eq!(
        harness.bridge.source_nio().unwrap().stats().snapshot().packets_in,
        0
    );

    harness.bridge.stop().unwrap();
    assert!(!harness.bridge.is_running());
    assert!(matches!(
        harness.bridge.stop(),
        Err(BridgeError::NotRunning)
    ));
}

#[test]
fn survives_stop_start_cycles() {
    let mut harness = Harness::new("cycle");
    for _ in 0..3 {
        harness.bridge.start().unwrap();
        harness.send_to_source(b"ping");
        assert_eq!(harness.recv_from_destination(), b"ping");
        harness.bridge.stop().unwrap();
    }
}

#[test]
fn frequency_drop_filters_inline() {
    let mut harness = Harness::new("filtered");
    harness
        .bridge
        .add_filter("drop3", "frequency_drop", &["3".to_owned()])
        .unwrap();
    harness.bridge.start().unwrap();

    for i in 0..9u8 {
        harness.send_to_source(&[i]);
    }

    // Every third frame is dropped; the rest arrive in order.
    let mut delivered = Vec::new();
    for _ in 0..6 {
        delivered.push(harness.recv_from_destination()[0]);
    }
    assert_eq!(delivered, vec![0, 1, 3, 4, 6, 7]);
    assert!(harness.ext_b.recv_from(&mut [0u8; 16]).is_err());
}

#[test]
fn filters_can_change_while_running() {
    let mut harness = Harness::new("live-filters");
    harness.bridge.start().unwrap();

    harness.send_to_source(b"before");
    assert_eq!(harness.recv_from_destination(), b"before");

    harness
        .bridge
        .add_filter("all", "frequency_drop", &["-1".to_owned()])
        .unwrap();
    harness.send_to_source(b"blocked");
    assert!(harness.ext_b.recv_from(&mut [0u8; 16]).is_err());

    assert!(harness.bridge.delete_filter("all"));
    harness.send_to_source(b"after");
    assert_eq!(harness.recv_from_destination(), b"after");
}

#[test]
fn capture_records_forwarded_frames() {
    let path = temp_pcap("inline");
    let mut harness = Harness::new("captured");
    harness
        .bridge
        .start_capture(&path, crate::capture::DEFAULT_LINKTYPE)
        .unwrap();
    assert!(matches!(
        harness.bridge.start_capture(&path, "EN10MB"),
        Err(BridgeError::CaptureActive)
    ));

    harness.bridge.start().unwrap();
    for _ in 0..5 {
        harness.send_to_source(&[0x55u8; 60]);
        harness.recv_from_destination();
    }
    harness.bridge.stop().unwrap();
    harness.bridge.stop_capture().unwrap();
    assert!(matches!(
        harness.bridge.stop_capture(),
        Err(BridgeError::CaptureInactive)
    ));

    let data = std::fs::read(&path).unwrap();
    let mut offset = 24;
    let mut records = 0;
    while offset + 16 <= data.len() {
        let caplen = u32::from_le_bytes(data[offset + 8..offset + 12].try_into().unwrap()) as usize;
        let orig_len =
            u32::from_le_bytes(data[offset + 12..offset + 16].try_into().unwrap()) as usize;
        assert_eq!(orig_len, 60);
        offset += 16 + caplen;
        records += 1;
    }
    assert_eq!(records, 5);
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn delete_nio_udp_matches_all_three_fields() {
    let ext = free_udp_port();
    let local = free_udp_port();
    let mut bridge = Bridge::new("matcher");
    bridge
        .add_nio(Nio::udp(local, "127.0.0.1", ext).unwrap())
        .unwrap();

    // Only the host differs: no match.
    assert!(!bridge.delete_nio_udp(local, "127.0.0.250", ext));
    // Only a port differs: no match.
    assert!(!bridge.delete_nio_udp(local, "127.0.0.1", ext.wrapping_add(1)));
    // Exact match removes the NIO.
    assert!(bridge.delete_nio_udp(local, "127.0.0.1", ext));
    assert_eq!(bridge.nio_count(), 0);
}

#[test]
fn set_pcap_filter_needs_an_ethernet_nio() {
    let mut bridge = Bridge::new("no-eth");
    bridge
        .add_nio(Nio::udp(free_udp_port(), "127.0.0.1", free_udp_port()).unwrap())
        .unwrap();
    assert!(matches!(
        bridge.set_pcap_filter("udp"),
        Err(SetPcapFilterError::NoEthernetNio)
    ));
}
