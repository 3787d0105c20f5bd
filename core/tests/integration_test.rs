use netio_core::transport::TransportError;
use netio_core::{
    EndpointAddress, HostAddress, NetIo, NetPacket, ReliableConfig, ReliableUdpTransport,
    TcpTransport, TransportCallback, UdpConfig, UdpTransport,
};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_test::assert_ok;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Conn(EndpointAddress),
    Disconn(EndpointAddress, String),
    Packet(EndpointAddress, Vec<u8>),
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Seen>>,
    reject: bool,
}

impl Recorder {
    /// Refuses every connection in `on_conn`.
    fn rejecting() -> Self {
        Recorder {
            reject: true,
            ..Recorder::default()
        }
    }

    fn snapshot(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    fn conns(&self) -> Vec<EndpointAddress> {
        self.snapshot()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Conn(addr) => Some(addr),
                _ => None,
            })
            .collect()
    }

    fn disconns(&self) -> Vec<(EndpointAddress, String)> {
        self.snapshot()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Disconn(addr, reason) => Some((addr, reason)),
                _ => None,
            })
            .collect()
    }

    fn packets(&self) -> Vec<(EndpointAddress, Vec<u8>)> {
        self.snapshot()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Packet(addr, data) => Some((addr, data)),
                _ => None,
            })
            .collect()
    }
}

impl TransportCallback for Recorder {
    fn on_conn(
        &self,
        peer: &EndpointAddress,
        _connect_addr: &EndpointAddress,
        _own_addr: Option<&EndpointAddress>,
        _io: &dyn NetIo,
    ) -> bool {
        self.seen.lock().push(Seen::Conn(*peer));
        !self.reject
    }

    fn on_disconn(&self, peer: &EndpointAddress, _io: &dyn NetIo, reason: &str) {
        self.seen
            .lock()
            .push(Seen::Disconn(*peer, reason.to_string()));
    }

    fn on_packet(&self, packet: &NetPacket, _io: &dyn NetIo) {
        self.seen
            .lock()
            .push(Seen::Packet(packet.addr, packet.data.to_vec()));
    }
}

fn localhost(port: u16) -> EndpointAddress {
    EndpointAddress::new(HostAddress::V4(Ipv4Addr::LOCALHOST), port)
}

fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("free port")
}

fn spawn_executor(io: Arc<dyn NetIo>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if io.execute(Some(Duration::from_millis(50))).await.is_err() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    })
}

/// Polls `condition` for up to `secs` seconds.
async fn wait_for(secs: u64, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_connect_send_close() {
    let server = Arc::new(TcpTransport::default());
    let server_events = Arc::new(Recorder::default());
    server.set_callback(server_events.clone());
    assert_ok!(server.init(free_tcp_port()).await);
    let server_port = server.local_port().expect("listening");

    let client = Arc::new(TcpTransport::default());
    let client_events = Arc::new(Recorder::default());
    client.set_callback(client_events.clone());
    assert_ok!(client.init(0).await);

    let executors = vec![
        spawn_executor(server.clone()),
        spawn_executor(client.clone()),
    ];

    let target = localhost(server_port);
    assert_ok!(client.connect(&target));
    assert!(
        wait_for(5, || client_events.conns().len() == 1 && server_events.conns().len() == 1).await,
        "Timeout waiting for connection"
    );
    assert_eq!(client_events.conns(), vec![target]);

    let big = payload(200_000);
    assert_ok!(client.send(NetPacket::new(target, &b"hello"[..])));
    assert_ok!(client.send(NetPacket::new(target, big.clone())));
    assert!(wait_for(5, || server_events.packets().len() == 2).await);

    let packets = server_events.packets();
    assert_eq!(packets[0].1, b"hello");
    assert_eq!(packets[1].1, big);
    let client_addr = packets[0].0;
    assert_eq!(client_addr, server_events.conns()[0]);

    assert_ok!(server.send(NetPacket::new(client_addr, &b"reply"[..])));
    assert!(wait_for(5, || client_events.packets().len() == 1).await);
    assert_eq!(client_events.packets()[0], (target, b"reply".to_vec()));

    let stats = client.conn_statistic(&target).expect("statistic");
    assert!(stats.out_rate > big.len() as u64);

    assert_ok!(client.close_peer(&target));
    assert!(
        wait_for(5, || server_events.disconns().len() == 1 && client_events.disconns().len() == 1)
            .await
    );
    assert_eq!(client_events.disconns(), vec![(target, "closed".to_string())]);
    assert_eq!(server_events.disconns()[0].0, client_addr);
    assert!(matches!(
        client.send(NetPacket::new(target, &b"late"[..])),
        Err(TransportError::UnknownPeer(_))
    ));

    for executor in executors {
        executor.abort();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reliable_connect_and_large_packet() {
    let a = Arc::new(ReliableUdpTransport::default());
    let b = Arc::new(ReliableUdpTransport::default());
    let a_events = Arc::new(Recorder::default());
    let b_events = Arc::new(Recorder::default());
    a.set_callback(a_events.clone());
    b.set_callback(b_events.clone());
    assert_ok!(a.init(0).await);
    assert_ok!(b.init(0).await);
    let a_addr = localhost(a.local_port().expect("port"));
    let b_addr = localhost(b.local_port().expect("port"));

    let executors = vec![spawn_executor(a.clone()), spawn_executor(b.clone())];

    assert_ok!(a.connect(&b_addr));
    assert!(
        wait_for(5, || a_events.conns().len() == 1 && b_events.conns().len() == 1).await,
        "Timeout waiting for handshake"
    );
    assert_eq!(a_events.conns(), vec![b_addr]);
    assert_eq!(b_events.conns(), vec![a_addr]);

    let big = payload(100_000);
    assert_ok!(a.send(NetPacket::new(b_addr, big.clone())));
    assert_ok!(a.send(NetPacket::new(b_addr, &b"after"[..])));
    assert!(
        wait_for(15, || b_events.packets().len() == 2).await,
        "Timeout waiting for delivery"
    );
    let packets = b_events.packets();
    assert_eq!(packets[0], (a_addr, big));
    assert_eq!(packets[1], (a_addr, b"after".to_vec()));

    // no second on_conn during the whole exchange
    assert_eq!(a_events.conns().len(), 1);
    assert_eq!(b_events.conns().len(), 1);

    assert_ok!(a.close_peer(&b_addr));
    assert!(wait_for(5, || a_events.disconns().len() == 1 && b_events.disconns().len() == 1).await);
    assert_eq!(a_events.disconns(), vec![(b_addr, "closed".to_string())]);
    assert_eq!(
        b_events.disconns(),
        vec![(a_addr, "connection closed by peer".to_string())]
    );

    for executor in executors {
        executor.abort();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reliable_silent_peer_times_out() {
    let config = ReliableConfig {
        std_timeout_ms: 100,
        connect_retries: 2,
        ..ReliableConfig::default()
    };
    let transport = Arc::new(ReliableUdpTransport::new(config));
    let events = Arc::new(Recorder::default());
    transport.set_callback(events.clone());
    assert_ok!(transport.init(0).await);

    // bound but never answering
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind");
    let target = localhost(silent.local_addr().expect("addr").port());

    let executor = spawn_executor(transport.clone());
    assert_ok!(transport.connect(&target));
    assert!(wait_for(5, || !events.disconns().is_empty()).await);
    assert_eq!(
        events.disconns(),
        vec![(target, "connection timeout".to_string())]
    );
    assert!(events.conns().is_empty());
    executor.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reliable_broadcast_and_close() {
    let a = Arc::new(ReliableUdpTransport::default());
    let b = Arc::new(ReliableUdpTransport::default());
    let a_events = Arc::new(Recorder::default());
    let b_events = Arc::new(Recorder::default());
    a.set_callback(a_events.clone());
    b.set_callback(b_events.clone());
    assert_ok!(a.init(0).await);
    assert_ok!(b.init(0).await);
    let a_port = a.local_port().expect("port");
    let b_addr = localhost(b.local_port().expect("port"));

    // multicast may be unavailable here; unicast must work either way
    let group: EndpointAddress = format!("[ff3e:0:40::8000:4242]:{}", a_port)
        .parse()
        .expect("group");
    match a.init_broadcast(Some(group)).await {
        Ok(joined) => assert_eq!(joined, group),
        Err(e) => assert!(
            matches!(
                e,
                TransportError::LoopbackTestFailed
                    | TransportError::InvalidBroadcastAddress(_)
                    | TransportError::Socket { .. }
            ),
            "unexpected error {}",
            e
        ),
    }

    let executors = vec![spawn_executor(a.clone()), spawn_executor(b.clone())];
    assert_ok!(a.connect(&b_addr));
    assert!(wait_for(5, || a_events.conns().len() == 1 && b_events.conns().len() == 1).await);

    // ports differ, so the connection stays unicast
    assert!(!a.is_multicast_peer(&b_addr));
    assert_ok!(a.set_broadcast(&b_addr, true));
    assert_ok!(a.broadcast(NetPacket::new(EndpointAddress::default(), &b"to all"[..])));
    assert!(wait_for(5, || b_events.packets().len() == 1).await);
    assert_eq!(b_events.packets()[0].1, b"to all");

    a.clear_statistic();
    assert_eq!(a.broadcast_rate(), 0);

    assert_ok!(a.close().await);
    assert_eq!(
        a_events.disconns(),
        vec![(b_addr, "owner class closed".to_string())]
    );
    assert!(wait_for(5, || b_events.disconns().len() == 1).await);
    assert!(matches!(
        a.send(NetPacket::new(b_addr, &b"x"[..])),
        Err(TransportError::NotInitialized)
    ));

    // the transport can be brought up again
    assert_ok!(a.init(0).await);
    assert!(a.local_port().is_some());

    for executor in executors {
        executor.abort();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_udp_through_trait_object() {
    let receiver = Arc::new(UdpTransport::default());
    let events = Arc::new(Recorder::default());
    receiver.set_callback(events.clone());
    assert_ok!(receiver.init(0).await);
    let sender: Arc<dyn NetIo> = Arc::new(UdpTransport::default());
    assert_ok!(sender.init(0).await);

    let executor = spawn_executor(receiver.clone());
    let target = localhost(receiver.local_port().expect("port"));
    for _ in 0..3 {
        assert_ok!(sender.send(NetPacket::new(target, &b"datagram"[..])));
    }
    assert!(wait_for(5, || !events.packets().is_empty()).await);
    assert_eq!(events.packets()[0].1, b"datagram");
    assert_eq!(
        events.packets()[0].0,
        localhost(sender.local_port().expect("port"))
    );
    assert!(events.conns().is_empty());
    executor.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_rejected_connection() {
    let server = Arc::new(TcpTransport::default());
    let server_events = Arc::new(Recorder::rejecting());
    server.set_callback(server_events.clone());
    assert_ok!(server.init(free_tcp_port()).await);
    let target = localhost(server.local_port().expect("listening"));

    let client = Arc::new(TcpTransport::default());
    let client_events = Arc::new(Recorder::default());
    client.set_callback(client_events.clone());
    assert_ok!(client.init(0).await);

    let executors = vec![
        spawn_executor(server.clone()),
        spawn_executor(client.clone()),
    ];
    assert_ok!(client.connect(&target));
    assert!(wait_for(5, || client_events.conns().len() == 1).await);
    // may already fail if the server closed the stream
    let _ = client.send(NetPacket::new(target, &b"unwanted"[..]));

    assert!(
        wait_for(5, || server_events.disconns().len() == 1 && client_events.disconns().len() == 1)
            .await,
        "Timeout waiting for rejection"
    );
    let client_addr = server_events.conns()[0];
    assert_eq!(
        server_events.disconns(),
        vec![(client_addr, "connection rejected".to_string())]
    );
    assert_eq!(client_events.disconns()[0].0, target);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server_events.packets().is_empty());
    assert!(server.conn_statistic(&client_addr).is_none());

    for executor in executors {
        executor.abort();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reliable_rejected_connection() {
    let a = Arc::new(ReliableUdpTransport::default());
    let b = Arc::new(ReliableUdpTransport::default());
    let a_events = Arc::new(Recorder::default());
    let b_events = Arc::new(Recorder::rejecting());
    a.set_callback(a_events.clone());
    b.set_callback(b_events.clone());
    assert_ok!(a.init(0).await);
    assert_ok!(b.init(0).await);
    let a_addr = localhost(a.local_port().expect("port"));
    let b_addr = localhost(b.local_port().expect("port"));

    let executors = vec![spawn_executor(a.clone()), spawn_executor(b.clone())];
    assert_ok!(a.connect(&b_addr));
    assert_ok!(a.send(NetPacket::new(b_addr, &b"unwanted"[..])));

    assert!(
        wait_for(5, || a_events.disconns().len() == 1 && b_events.disconns().len() == 1).await,
        "Timeout waiting for rejection"
    );
    assert_eq!(b_events.conns(), vec![a_addr]);
    assert_eq!(
        b_events.disconns(),
        vec![(a_addr, "connection rejected".to_string())]
    );
    assert_eq!(a_events.conns(), vec![b_addr]);
    assert_eq!(
        a_events.disconns(),
        vec![(b_addr, "connection closed by peer".to_string())]
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(b_events.packets().is_empty());
    assert!(b.conn_statistic(&a_addr).is_none());

    for executor in executors {
        executor.abort();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reliable_loopback_failure_keeps_unicast() {
    // no time for the probe to come back
    let config = ReliableConfig {
        udp: UdpConfig {
            loopback_timeout_ms: 0,
            ..UdpConfig::default()
        },
        ..ReliableConfig::default()
    };
    let a = Arc::new(ReliableUdpTransport::new(config));
    let b = Arc::new(ReliableUdpTransport::default());
    let a_events = Arc::new(Recorder::default());
    let b_events = Arc::new(Recorder::default());
    a.set_callback(a_events.clone());
    b.set_callback(b_events.clone());
    assert_ok!(a.init(0).await);
    assert_ok!(b.init(0).await);
    let b_addr = localhost(b.local_port().expect("port"));

    let group: EndpointAddress = format!("[ff3e:0:40::8000:4244]:{}", a.local_port().expect("port"))
        .parse()
        .expect("group");
    let result = a.init_broadcast(Some(group)).await;
    assert!(
        matches!(
            result,
            Err(TransportError::LoopbackTestFailed
                | TransportError::Socket { .. }
                | TransportError::InvalidBroadcastAddress(_))
        ),
        "unexpected result {:?}",
        result
    );
    assert_eq!(a.multicast_group(), None);

    let executors = vec![spawn_executor(a.clone()), spawn_executor(b.clone())];
    assert_ok!(a.connect(&b_addr));
    assert!(wait_for(5, || a_events.conns().len() == 1 && b_events.conns().len() == 1).await);
    assert!(!a.is_multicast_peer(&b_addr));

    assert_ok!(a.set_broadcast(&b_addr, true));
    assert_ok!(a.broadcast(NetPacket::new(EndpointAddress::default(), &b"unicast after all"[..])));
    assert_ok!(a.send(NetPacket::new(b_addr, &b"direct"[..])));
    assert!(wait_for(5, || b_events.packets().len() == 2).await);
    let payloads: Vec<Vec<u8>> = b_events.packets().into_iter().map(|(_, d)| d).collect();
    assert_eq!(payloads, vec![b"unicast after all".to_vec(), b"direct".to_vec()]);

    for executor in executors {
        executor.abort();
    }
}

