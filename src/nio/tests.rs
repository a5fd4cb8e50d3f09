use super::*;
use crate::nio::udp::UdpNio;
use std::net::UdpSocket;
use std::path::PathBuf;

fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("netbridge-nio-{}-{}", std::process::id(), name))
}

#[test]
fn udp_pair_round_trip() {
    let port_a = free_udp_port();
    let port_b = free_udp_port();
    let nio_a = Nio::udp(port_a, "127.0.0.1", port_b).unwrap();
    let nio_b = Nio::udp(port_b, "127.0.0.1", port_a).unwrap();

    let payload = [0x42u8; 64];
    assert_eq!(nio_a.send(&payload).unwrap(), payload.len());

    let mut buf = [0u8; 128];
    let received = nio_b.recv(&mut buf).unwrap();
    assert_eq!(&buf[..received], &payload[..]);
}

#[test]
fn udp_recv_observes_poll_timeout() {
    let port = free_udp_port();
    let nio = Nio::udp(port, "127.0.0.1", free_udp_port()).unwrap();
    let mut buf = [0u8; 16];
    let err = nio.recv(&mut buf).unwrap_err();
    assert!(is_timeout(&err), "unexpected error kind: {err:?}");
}

#[test]
fn udp_reports_endpoints_and_description() {
    let port_a = free_udp_port();
    let port_b = free_udp_port();
    let nio = Nio::udp(port_a, "127.0.0.1", port_b).unwrap();
    assert_eq!(nio.udp_endpoints(), Some((port_a, "127.0.0.1", port_b)));
    assert_eq!(nio.description(), format!("{port_a}:127.0.0.1:{port_b}"));
    assert!(!nio.is_ethernet());
    assert!(!nio.is_tap());
}

#[test]
fn udp_local_port_resolved_when_ephemeral() {
    let nio = UdpNio::new(0, "127.0.0.1", free_udp_port()).unwrap();
    assert_ne!(nio.local_port(), 0);
}

#[test]
fn unix_pair_round_trip_and_cleanup() {
    let path_a = temp_path("unix-a");
    let path_b = temp_path("unix-b");
    {
        let nio_a = Nio::unix(path_a.to_str().unwrap(), path_b.to_str().unwrap()).unwrap();
        let nio_b = Nio::unix(path_b.to_str().unwrap(), path_a.to_str().unwrap()).unwrap();

        let payload = b"frame across the local socket";
        nio_a.send(payload).unwrap();
        let mut buf = [0u8; 64];
        let received = nio_b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..received], payload);
        assert!(path_a.exists());
    }
    // Destruction unlinks the socket files the endpoints created.
    assert!(!path_a.exists());
    assert!(!path_b.exists());
}

#[test]
fn unix_rejects_oversized_paths() {
    let long = "x".repeat(200);
    assert!(Nio::unix(&long, "/tmp/peer").is_err());
}

#[test]
fn stats_accumulate_and_reset() {
    let stats = NioStats::default();
    stats.record_in(100);
    stats.record_in(50);
    stats.record_out(25);
    let snap = stats.snapshot();
    assert_eq!(snap.packets_in, 2);
    assert_eq!(snap.bytes_in, 150);
    assert_eq!(snap.packets_out, 1);
    assert_eq!(snap.bytes_out, 25);

    stats.reset();
    assert_eq!(stats.snapshot(), StatsSnapshot::default());
}

#[test]
fn transient_error_classification() {
    let refused = io::Error::from_raw_os_error(libc::ECONNREFUSED);
    let netdown = io::Error::from_raw_os_error(libc::ENETDOWN);
    let timeout = io::Error::from(io::ErrorKind::WouldBlock);
    let hard = io::Error::from_raw_os_error(libc::EBADF);
    assert!(is_transient(&refused));
    assert!(is_transient(&netdown));
    assert!(!is_transient(&hard));
    assert!(is_timeout(&timeout));
    assert!(!is_timeout(&hard));
}
