use super::*;
use crate::nio::Nio;
use std::net::UdpSocket;
use std::sync::atomic::AtomicU16;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// Application/peer IDs unique per test process and per call so concurrent
// test runs never collide on /tmp/netio<uid> paths.
static NEXT_ID: AtomicU16 = AtomicU16::new(0);

fn unique_id() -> u16 {
    let offset = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    20000 + (std::process::id() % 500) as u16 * 64 + offset
}

fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn bind_peer(iol_id: u16) -> std::os::unix::net::UnixDatagram {
    let _ = std::fs::create_dir_all(netio_directory());
    let path = netio_directory().join(iol_id.to_string());
    let _ = std::fs::remove_file(&path);
    let socket = std::os::unix::net::UnixDatagram::bind(&path).unwrap();
    socket.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
    socket
}

fn remove_peer(iol_id: u16) {
    let _ = std::fs::remove_file(netio_directory().join(iol_id.to_string()));
}

#[test]
fn header_round_trip_is_bit_identical() {
    let bytes = [0x00, 0xC8, 0x02, 0x01, 0x10, 0x10, 0x01, 0x00];
    let header = IolHeader::from_bytes(&bytes);
    assert_eq!(header.destination_id, 200);
    assert_eq!(header.source_id, 513);
    assert_eq!(header.destination_port, 16);
    assert_eq!(header.source_port, 16);
    assert_eq!(header.message_type, 1);
    assert_eq!(header.channel, 0);
    assert_eq!(header.to_bytes(), bytes);
}

#[test]
fn data_header_matches_wire_layout() {
    // bay 0, unit 1 -> port key 16.
    let header = IolHeader::data(200, 513, 16);
    assert_eq!(
        header.to_bytes(),
        [0x00, 0xC8, 0x02, 0x01, 0x10, 0x10, 0x01, 0x00]
    );
}

#[test]
fn port_key_layout_and_bounds() {
    assert_eq!(port_key(0, 1).unwrap(), 16);
    assert_eq!(port_key(3, 2).unwrap(), 35);
    assert_eq!(port_key(15, 15).unwrap(), 255);
    assert!(matches!(
        port_key(16, 15),
        Err(IolError::PortOutOfRange(_))
    ));
}

#[test]
fn create_claims_socket_and_lock_file() {
    let app_id = unique_id();
    let socket_path;
    let lock_path;
    {
        let bridge = IolBridge::create("locked", app_id).unwrap();
        socket_path = bridge.socket_path().to_path_buf();
        lock_path = PathBuf::from(format!("{}.lck", socket_path.display()));
        assert!(socket_path.exists());
        assert!(lock_path.exists());

        let contents = std::fs::read_to_string(&lock_path).unwrap();
        assert_eq!(
            contents.trim().parse::<u32>().unwrap(),
            std::process::id()
        );
    }
    // Destruction removes both the backplane socket and the lock file.
    assert!(!socket_path.exists());
    assert!(!lock_path.exists());
}

#[test]
fn add_nio_rejects_id_collision_and_bad_ports() {
    let app_id = unique_id();
    let mut bridge = IolBridge::create("validation", app_id).unwrap();

    let nio = Nio::udp(free_udp_port(), "127.0.0.1", free_udp_port()).unwrap();
    assert!(matches!(
        bridge.add_nio_udp(app_id, 0, 0, nio),
        Err(IolError::IdCollision(_))
    ));

    let nio = Nio::udp(free_udp_port(), "127.0.0.1", free_udp_port()).unwrap();
    assert!(matches!(
        bridge.add_nio_udp(app_id + 1, 255, 15, nio),
        Err(IolError::PortOutOfRange(_))
    ));

    assert!(matches!(
        bridge.delete_nio(0, 0),
        Err(IolError::PortNotFound { .. })
    ));
}

#[test]
fn outbound_frames_carry_the_precomputed_header() {
    let app_id = unique_id();
    let iol_id = unique_id();
    let peer = bind_peer(iol_id);

    let udp_port = free_udp_port();
    let ext = UdpSocket::bind("127.0.0.1:0").unwrap();

    let mut bridge = IolBridge::create("framing", app_id).unwrap();
    bridge
        .add_nio_udp(
            iol_id,
            0,
            1,
            Nio::udp(udp_port, "127.0.0.1", ext.local_addr().unwrap().port()).unwrap(),
        )
        .unwrap();
    bridge.start().unwrap();
    assert!(matches!(bridge.start(), Err(IolError::AlreadyRunning)));

    let payload = [0x5Au8; 100];
    ext.send_to(&payload, ("127.0.0.1", udp_port)).unwrap();

    let mut buf = [0u8; 256];
    let received = peer.recv(&mut buf).unwrap();
    assert_eq!(received, IOL_HDR_SIZE + payload.len());

    let header = IolHeader::from_bytes(&buf[..IOL_HDR_SIZE].try_into().unwrap());
    assert_eq!(header.destination_id, iol_id);
    assert_eq!(header.source_id, app_id);
    assert_eq!(header.destination_port, 16);
    assert_eq!(header.source_port, 16);
    assert_eq!(header.message_type, 1);
    assert_eq!(header.channel, 0);
    assert_eq!(&buf[IOL_HDR_SIZE..received], &payload[..]);

    let summaries = bridge.port_summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].stats.packets_in, 1);

    bridge.stop().unwrap();
    remove_peer(iol_id);
}

#[test]
fn inbound_frames_are_demuxed_and_stripped() {
    let app_id = unique_id();
    let iol_id = unique_id();
    let peer = bind_peer(iol_id);

    let udp_port = free_udp_port();
    let ext = UdpSocket::bind("127.0.0.1:0").unwrap();
    ext.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();

    let mut bridge = IolBridge::create("demux", app_id).unwrap();
    bridge
        .add_nio_udp(
            iol_id,
            0,
            1,
            Nio::udp(udp_port, "127.0.0.1", ext.local_addr().unwrap().port()).unwrap(),
        )
        .unwrap();
    bridge.start().unwrap();

    // A frame from the peer instance addressed to port key 16.
    let header = IolHeader::data(app_id, iol_id, 16).to_bytes();
    let mut frame = Vec::from(header);
    frame.extend_from_slice(b"payload for port 0/1");
    peer.send_to(&frame, bridge.socket_path()).unwrap();

    let mut buf = [0u8; 256];
    let (received, _) = ext.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..received], b"payload for port 0/1");

    // Runt datagrams (header only or shorter) are ignored.
    peer.send_to(&header, bridge.socket_path()).unwrap();
    peer.send_to(b"tiny", bridge.socket_path()).unwrap();
    assert!(ext.recv_from(&mut buf).is_err());

    bridge.stop().unwrap();
    remove_peer(iol_id);
}

#[test]
fn port_filters_drop_on_the_way_to_the_backplane() {
    let app_id = unique_id();
    let iol_id = unique_id();
    let peer = bind_peer(iol_id);

    let udp_port = free_udp_port();
    let ext = UdpSocket::bind("127.0.0.1:0").unwrap();

    let mut bridge = IolBridge::create("port-filtered", app_id).unwrap();
    bridge
        .add_nio_udp(
            iol_id,
            0,
            0,
            Nio::udp(udp_port, "127.0.0.1", ext.local_addr().unwrap().port()).unwrap(),
        )
        .unwrap();
    bridge
        .add_port_filter(0, 0, "all", "frequency_drop", &["-1".to_owned()])
        .unwrap();
    assert!(matches!(
        bridge.add_port_filter(0, 0, "all", "frequency_drop", &["-1".to_owned()]),
        Err(IolError::Filter(_))
    ));
    assert!(matches!(
        bridge.add_port_filter(1, 0, "x", "frequency_drop", &["0".to_owned()]),
        Err(IolError::PortNotFound { .. })
    ));

    bridge.start().unwrap();
    ext.send_to(&[1u8; 32], ("127.0.0.1", udp_port)).unwrap();
    let mut buf = [0u8; 64];
    assert!(peer.recv(&mut buf).is_err());

    // Clearing the chain lets frames through again.
    bridge.reset_port_filters(0, 0).unwrap();
    ext.send_to(&[2u8; 32], ("127.0.0.1", udp_port)).unwrap();
    let received = peer.recv(&mut buf).unwrap();
    assert_eq!(received, IOL_HDR_SIZE + 32);

    bridge.stop().unwrap();
    remove_peer(iol_id);
}

#[test]
fn replacing_a_port_entry_joins_the_old_listener() {
    let app_id = unique_id();
    let iol_id = unique_id();

    let mut bridge = IolBridge::create("replace", app_id).unwrap();
    bridge
        .add_nio_udp(
            iol_id,
            1,
            0,
            Nio::udp(free_udp_port(), "127.0.0.1", free_udp_port()).unwrap(),
        )
        .unwrap();
    bridge.start().unwrap();

    // Replacement while running: the old listener is joined, the new one
    // spawned against the same port key.
    bridge
        .add_nio_udp(
            iol_id,
            1,
            0,
            Nio::udp(free_udp_port(), "127.0.0.1", free_udp_port()).unwrap(),
        )
        .unwrap();
    assert_eq!(bridge.port_count(), 1);

    bridge.stop().unwrap();
    assert!(matches!(bridge.stop(), Err(IolError::NotRunning)));
}

#[test]
fn create_delete_create_reuses_the_application_id() {
    let app_id = unique_id();
    let first = IolBridge::create("first", app_id).unwrap();
    drop(first);
    let second = IolBridge::create("second", app_id).unwrap();
    assert_eq!(second.application_id(), app_id);
}
