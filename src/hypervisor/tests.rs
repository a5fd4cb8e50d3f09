use super::*;
use std::io::BufRead as _;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

fn start_server() -> (SocketAddr, JoinHandle<()>) {
    let registry = Registry::shared();
    let server = Server::bind(registry, Some("127.0.0.1"), 0).unwrap();
    let addr = server.local_addrs()[0];
    let handle = thread::spawn(move || server.run(|| false));
    (addr, handle)
}

struct Client {
    reader: BufReader<TcpStream>,
    stream: TcpStream,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self { reader, stream }
    }

    /// Sends one request and collects reply lines up to the terminal one
    /// (3-digit status followed by a space).
    fn request(&mut self, line: &str) -> Vec<String> {
        self.stream
            .write_all(format!("{line}\r\n").as_bytes())
            .unwrap();
        let mut replies = Vec::new();
        loop {
            let mut reply = String::new();
            let read = self.reader.read_line(&mut reply).unwrap();
            assert!(read > 0, "connection closed while waiting for a reply");
            let reply = reply.trim_end_matches(['\r', '\n']).to_owned();
            assert!(reply.len() >= 4, "malformed reply line: {reply:?}");
            let terminal = reply.as_bytes()[3] == b' ';
            replies.push(reply);
            if terminal {
                return replies;
            }
        }
    }

    fn expect_status(&mut self, line: &str, status: u16) -> Vec<String> {
        let replies = self.request(line);
        let last = replies.last().unwrap();
        assert!(
            last.starts_with(&format!("{status:03} ")),
            "expected status {status} for '{line}', got {last:?}"
        );
        replies
    }
}

fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[test]
fn version_and_module_listing() {
    let (addr, server) = start_server();
    let mut client = Client::connect(addr);

    let replies = client.expect_status("hypervisor version", status::INFO_OK);
    assert_eq!(replies, vec![format!("100 {VERSION}")]);

    let replies = client.expect_status("hypervisor module_list", status::INFO_OK);
    assert!(replies.contains(&"101-hypervisor".to_owned()));
    assert!(replies.contains(&"101-bridge".to_owned()));

    let replies = client.expect_status("hypervisor cmd_list bridge", status::INFO_OK);
    assert!(replies
        .iter()
        .any(|line| line.contains("create (min/max args: 1/1)")));
    client.expect_status("hypervisor cmd_list nosuch", status::ERR_UNK_MODULE);

    client.expect_status("hypervisor stop", status::INFO_OK);
    server.join().unwrap();
}

#[test]
fn protocol_error_replies() {
    let (addr, server) = start_server();
    let mut client = Client::connect(addr);

    client.expect_status("nosuchmodule list", status::ERR_UNK_MODULE);
    client.expect_status("bridge levitate", status::ERR_UNK_CMD);
    client.expect_status("bridge create", status::ERR_BAD_PARAM);
    client.expect_status("bridge create a b c", status::ERR_BAD_PARAM);
    client.expect_status("bridge", status::ERR_PARSING);
    client.expect_status("bridge create \"unterminated", status::ERR_PARSING);
    client.expect_status("bridge add_nio_udp br0 notaport 127.0.0.1 0", status::ERR_INV_PARAM);

    client.expect_status("hypervisor stop", status::INFO_OK);
    server.join().unwrap();
}

#[test]
fn bridge_lifecycle_and_rename_collisions() {
    let (addr, server) = start_server();
    let mut client = Client::connect(addr);

    client.expect_status("bridge create a", status::INFO_OK);
    client.expect_status("bridge create b", status::INFO_OK);
    client.expect_status("bridge create a", status::ERR_CREATE);

    client.expect_status("bridge rename a b", status::ERR_RENAME);
    client.expect_status("bridge rename a c", status::INFO_OK);
    client.expect_status("bridge show a", status::ERR_NOT_FOUND);
    client.expect_status("bridge show c", status::INFO_OK);

    client.expect_status("bridge start c", status::ERR_START);
    client.expect_status("bridge stop c", status::ERR_STOP);

    client.expect_status("bridge delete c", status::INFO_OK);
    client.expect_status("bridge delete c", status::ERR_NOT_FOUND);

    // create -> delete -> create with the same name works repeatedly.
    client.expect_status("bridge create b", status::ERR_CREATE);
    client.expect_status("bridge delete b", status::INFO_OK);
    client.expect_status("bridge create b", status::INFO_OK);

    client.expect_status("hypervisor stop", status::INFO_OK);
    server.join().unwrap();
}

#[test]
fn udp_bridge_forwards_and_reports_stats() {
    let (addr, server) = start_server();
    let mut client = Client::connect(addr);

    let ext_a = UdpSocket::bind("127.0.0.1:0").unwrap();
    let ext_b = UdpSocket::bind("127.0.0.1:0").unwrap();
    ext_b.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let port_a = free_udp_port();
    let port_b = free_udp_port();

    client.expect_status("bridge create b1", status::INFO_OK);
    client.expect_status(
        &format!(
            "bridge add_nio_udp b1 {port_a} 127.0.0.1 {}",
            ext_a.local_addr().unwrap().port()
        ),
        status::INFO_OK,
    );
    client.expect_status(
        &format!(
            "bridge add_nio_udp b1 {port_b} 127.0.0.1 {}",
            ext_b.local_addr().unwrap().port()
        ),
        status::INFO_OK,
    );
    client.expect_status("bridge start b1", status::INFO_OK);

    let payload = [0x11u8; 64];
    let mut buf = [0u8; 256];
    for _ in 0..10 {
        ext_a.send_to(&payload, ("127.0.0.1", port_a)).unwrap();
        let (received, _) = ext_b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..received], &payload[..]);
    }

    // The output counters are bumped right after the send that delivered
    // the last datagram; give the worker a moment to get there.
    std::thread::sleep(Duration::from_millis(50));
    let replies = client.expect_status("bridge get_stats b1", status::INFO_OK);
    assert!(
        replies
            .iter()
            .any(|line| line.starts_with("101-Source NIO") && line.contains("IN: 10 packets (640 bytes)")),
        "unexpected stats: {replies:?}"
    );
    assert!(
        replies
            .iter()
            .any(|line| line.starts_with("101-Destination NIO")
                && line.contains("OUT: 10 packets (640 bytes)")),
        "unexpected stats: {replies:?}"
    );

    client.expect_status("bridge reset_stats b1", status::INFO_OK);
    let replies = client.expect_status("bridge get_stats b1", status::INFO_OK);
    assert!(replies
        .iter()
        .any(|line| line.contains("IN: 0 packets (0 bytes)")));

    // NIO deletion only works on a stopped bridge and full matches.
    client.expect_status(
        &format!(
            "bridge delete_nio_udp b1 {port_a} 127.0.0.1 {}",
            ext_a.local_addr().unwrap().port()
        ),
        status::ERR_NOT_FOUND,
    );
    client.expect_status("bridge stop b1", status::INFO_OK);
    client.expect_status(
        &format!(
            "bridge delete_nio_udp b1 {port_a} 127.0.0.250 {}",
            ext_a.local_addr().unwrap().port()
        ),
        status::ERR_NOT_FOUND,
    );
    client.expect_status(
        &format!(
            "bridge delete_nio_udp b1 {port_a} 127.0.0.1 {}",
            ext_a.local_addr().unwrap().port()
        ),
        status::INFO_OK,
    );

    client.expect_status("hypervisor stop", status::INFO_OK);
    server.join().unwrap();
}

#[test]
fn filters_and_show_output() {
    let (addr, server) = start_server();
    let mut client = Client::connect(addr);

    client.expect_status("bridge create shown", status::INFO_OK);
    client.expect_status(
        "bridge add_packet_filter shown drop3 frequency_drop 3",
        status::INFO_OK,
    );
    client.expect_status(
        "bridge add_packet_filter shown lossy packet_loss 25",
        status::INFO_OK,
    );
    // Duplicate filter names are rejected.
    client.expect_status(
        "bridge add_packet_filter shown drop3 frequency_drop 5",
        status::ERR_CREATE,
    );
    // Unknown filter types are rejected.
    client.expect_status(
        "bridge add_packet_filter shown warp teleport 1",
        status::ERR_CREATE,
    );

    let replies = client.expect_status("bridge show shown", status::INFO_OK);
    assert!(replies.contains(&"101-bridge 'shown' is not running".to_owned()));
    assert!(replies.contains(&"101-Filter 'drop3' configured in position 1".to_owned()));
    assert!(replies.contains(&"101-Filter 'lossy' configured in position 2".to_owned()));

    client.expect_status("bridge delete_packet_filter shown drop3", status::INFO_OK);
    let replies = client.expect_status("bridge show shown", status::INFO_OK);
    assert!(replies.contains(&"101-Filter 'lossy' configured in position 1".to_owned()));

    client.expect_status("bridge reset_packet_filters shown", status::INFO_OK);
    let replies = client.expect_status("bridge show shown", status::INFO_OK);
    assert!(!replies.iter().any(|line| line.contains("Filter")));

    client.expect_status("hypervisor stop", status::INFO_OK);
    server.join().unwrap();
}

#[test]
fn reset_destroys_every_bridge() {
    let (addr, server) = start_server();
    let mut client = Client::connect(addr);

    client.expect_status("bridge create one", status::INFO_OK);
    client.expect_status("bridge create two", status::INFO_OK);
    let replies = client.expect_status("bridge list", status::INFO_OK);
    assert_eq!(replies.len(), 3);

    client.expect_status("hypervisor reset", status::INFO_OK);
    let replies = client.expect_status("bridge list", status::INFO_OK);
    assert_eq!(replies, vec!["100 OK".to_owned()]);

    client.expect_status("hypervisor stop", status::INFO_OK);
    server.join().unwrap();
}

#[test]
fn close_terminates_only_the_connection() {
    let (addr, server) = start_server();
    let mut client = Client::connect(addr);

    client.expect_status("bridge create keepme", status::INFO_OK);
    client.expect_status("hypervisor close", status::INFO_OK);
    let mut line = String::new();
    assert_eq!(client.reader.read_line(&mut line).unwrap(), 0);

    // State survives the connection; the server is still up.
    let mut second = Client::connect(addr);
    second.expect_status("bridge show keepme", status::INFO_OK);

    second.expect_status("hypervisor stop", status::INFO_OK);
    server.join().unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn iol_bridge_commands_over_the_wire() {
    let (addr, server) = start_server();
    let mut client = Client::connect(addr);

    let app_id = 53000 + (std::process::id() % 10000) as u16;
    client.expect_status(&format!("iol_bridge create wired {app_id}"), status::INFO_OK);
    client.expect_status(
        &format!("iol_bridge create other {app_id}"),
        status::ERR_CREATE,
    );

    let port = free_udp_port();
    client.expect_status(
        &format!(
            "iol_bridge add_nio_udp wired {} 0 1 {port} 127.0.0.1 {}",
            app_id + 1,
            free_udp_port()
        ),
        status::INFO_OK,
    );
    // The IOU ID may not collide with the bridge's own application ID.
    client.expect_status(
        &format!(
            "iol_bridge add_nio_udp wired {app_id} 0 2 {} 127.0.0.1 {}",
            free_udp_port(),
            free_udp_port()
        ),
        status::ERR_CREATE,
    );

    let replies = client.expect_status("iol_bridge list", status::INFO_OK);
    assert!(replies.contains(&"101-wired (ports = 1)".to_owned()));

    client.expect_status("iol_bridge start wired", status::INFO_OK);
    client.expect_status("iol_bridge start wired", status::ERR_START);
    client.expect_status("iol_bridge stop wired", status::INFO_OK);

    client.expect_status("iol_bridge delete_nio_udp wired 0 1", status::INFO_OK);
    client.expect_status("iol_bridge delete_nio_udp wired 0 1", status::ERR_NOT_FOUND);

    client.expect_status("iol_bridge delete wired", status::INFO_OK);
    client.expect_status("hypervisor stop", status::INFO_OK);
    server.join().unwrap();
}
