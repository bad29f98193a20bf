//! End-to-end relay tests over loopback sockets: a fake client sends to
//! the dispatcher, a fake backend asserts on what arrives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dl_balance::{algorithm_by_name, DhcpServer, HostSourcer};
use dl_codec::{v4, v6, ProtocolVersion};
use dl_config::{Config, ConfigStore};
use dl_relay::update::reconcile_once;
use dl_relay::{Handler, HandlerError, LogHelper, RelayServer, ServerPools};
use dl_throttle::Throttle;
use tokio::net::UdpSocket;
use tokio::time::timeout;

struct StaticSourcer {
    stable: Vec<Arc<DhcpServer>>,
    tier: Vec<Arc<DhcpServer>>,
}

#[async_trait]
impl HostSourcer for StaticSourcer {
    async fn stable_servers(&self) -> anyhow::Result<Vec<Arc<DhcpServer>>> {
        Ok(self.stable.clone())
    }
    async fn rc_servers(&self) -> anyhow::Result<Vec<Arc<DhcpServer>>> {
        Ok(Vec::new())
    }
    async fn servers_in_tier(&self, _tier: &str) -> anyhow::Result<Vec<Arc<DhcpServer>>> {
        Ok(self.tier.clone())
    }
}

/// Hands back a canned reply for every request.
struct StubHandler {
    reply: Vec<u8>,
}

#[async_trait]
impl Handler for StubHandler {
    async fn serve_v4(&self, _packet: &[u8]) -> Result<Vec<u8>, HandlerError> {
        Ok(self.reply.clone())
    }
    async fn serve_v6(&self, _packet: &[u8]) -> Result<Vec<u8>, HandlerError> {
        Ok(self.reply.clone())
    }
}

/// Everything a test scenario can tune; defaults describe a plain relay
/// with throttling off.
struct Scenario {
    version: ProtocolVersion,
    tier: Vec<Arc<DhcpServer>>,
    overrides: rustc_hash::FxHashMap<String, dl_config::Override>,
    throttle_rate: i64,
    server_mode: bool,
    handler: Option<Arc<dyn Handler>>,
}

impl Scenario {
    fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            tier: Vec::new(),
            overrides: Default::default(),
            throttle_rate: 0,
            server_mode: false,
            handler: None,
        }
    }

    fn into_config(self, backend: Arc<DhcpServer>) -> Config {
        let listen = match self.version {
            ProtocolVersion::V4 => "127.0.0.1:0",
            ProtocolVersion::V6 => "[::1]:0",
        };
        Config {
            version: self.version,
            listen_addr: listen.parse().unwrap(),
            algorithm: algorithm_by_name("xid", 0).unwrap(),
            update_server_interval: Duration::from_secs(3600),
            packet_buf_size: 1024,
            host_sourcer: Arc::new(StaticSourcer {
                stable: vec![backend],
                tier: self.tier,
            }),
            free_conn_timeout: Duration::from_secs(1),
            rc_ratio: 0,
            overrides: self.overrides,
            cache_size: 64,
            cache_rate: 1024,
            rate: self.throttle_rate,
            reply_addr: None,
            extras: None,
        }
    }
}

/// Bind a backend, wire a relay in front of it, return both.
async fn start_relay_with(mut scenario: Scenario) -> (Arc<RelayServer>, UdpSocket) {
    let version = scenario.version;
    let server_mode = scenario.server_mode;
    let handler = scenario.handler.take();
    let backend_addr = match version {
        ProtocolVersion::V4 => "127.0.0.1:0",
        ProtocolVersion::V6 => "[::1]:0",
    };
    let backend = UdpSocket::bind(backend_addr).await.unwrap();
    let backend_local = backend.local_addr().unwrap();
    let backend_server = Arc::new(DhcpServer::new(
        "test-backend",
        backend_local.ip(),
        backend_local.port(),
    ));

    let config = Arc::new(scenario.into_config(backend_server));
    let store = Arc::new(ConfigStore::new(config.clone()));
    let pools = Arc::new(ServerPools::new());
    reconcile_once(&config, &pools).await;

    let throttle = Arc::new(
        Throttle::new(config.cache_size, config.cache_rate, config.rate).unwrap(),
    );
    let logger = Arc::new(LogHelper::new(version, None));
    let relay =
        RelayServer::bind(store, pools, throttle, logger, handler, server_mode).unwrap();
    assert!(relay.has_servers().await);

    tokio::spawn(relay.clone().serve());
    (relay, backend)
}

async fn start_relay(version: ProtocolVersion) -> (Arc<RelayServer>, UdpSocket) {
    start_relay_with(Scenario::new(version)).await
}

fn make_v4_request() -> Vec<u8> {
    let mut pkt = vec![0u8; 240];
    pkt[0] = 1; // BOOTREQUEST
    pkt[1] = 1;
    pkt[2] = 6;
    pkt[3] = 1; // already crossed one relay
    pkt[4..8].copy_from_slice(&0xcafef00du32.to_be_bytes());
    pkt[28..34].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    pkt[236..240].copy_from_slice(&v4::MAGIC_COOKIE);
    pkt.extend_from_slice(&[53, 1, 3, 255]); // REQUEST, then END
    pkt
}

fn make_solicit() -> Vec<u8> {
    let mut pkt = vec![1u8, 0x12, 0x34, 0x56]; // SOLICIT
    let duid = [0x00, 0x03, 0x00, 0x01, 0x24, 0x8a, 0x07, 0x56, 0xdc, 0xa4];
    pkt.extend_from_slice(&1u16.to_be_bytes());
    pkt.extend_from_slice(&(duid.len() as u16).to_be_bytes());
    pkt.extend_from_slice(&duid);
    pkt
}

#[tokio::test]
async fn test_v4_forwarding_increments_hops_only() {
    let (relay, backend) = start_relay(ProtocolVersion::V4).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = make_v4_request();
    client
        .send_to(&request, relay.local_addr().unwrap())
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    let (n, _) = timeout(Duration::from_secs(5), backend.recv_from(&mut buf))
        .await
        .expect("backend saw no packet")
        .unwrap();

    let forwarded = &buf[..n];
    assert_eq!(forwarded.len(), request.len());
    assert_eq!(forwarded[3], request[3] + 1, "hop count must be bumped");
    // everything else is byte-for-byte identical
    assert_eq!(&forwarded[..3], &request[..3]);
    assert_eq!(&forwarded[4..], &request[4..]);
}

#[tokio::test]
async fn test_v4_malformed_packet_is_dropped() {
    let (relay, backend) = start_relay(ProtocolVersion::V4).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"way too short", relay.local_addr().unwrap())
        .await
        .unwrap();
    // a valid packet right after still gets through; the worker dropped
    // only the malformed one
    client
        .send_to(&make_v4_request(), relay.local_addr().unwrap())
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    let (n, _) = timeout(Duration::from_secs(5), backend.recv_from(&mut buf))
        .await
        .expect("backend saw no packet")
        .unwrap();
    assert_eq!(n, make_v4_request().len());
}

#[tokio::test]
async fn test_v6_forwarding_wraps_in_relay_forward() {
    let (relay, backend) = start_relay(ProtocolVersion::V6).await;

    let client = UdpSocket::bind("[::1]:0").await.unwrap();
    let solicit = make_solicit();
    client
        .send_to(&solicit, relay.local_addr().unwrap())
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    let (n, _) = timeout(Duration::from_secs(5), backend.recv_from(&mut buf))
        .await
        .expect("backend saw no packet")
        .unwrap();

    let wrapped = &buf[..n];
    let outer = v6::Packet6::parse(wrapped).unwrap();
    assert_eq!(outer.msg_type(), v6::MessageType::RelayForw);
    assert_eq!(outer.hops().unwrap(), 0);

    // decapsulating one layer recovers the original message and the
    // ingress source address
    let (inner, peer) = v6::unwind(wrapped).unwrap();
    assert_eq!(inner, &solicit[..]);
    assert_eq!(peer, client.local_addr().unwrap().ip().to_string().parse::<std::net::Ipv6Addr>().unwrap());
}

#[tokio::test]
async fn test_tier_override_redirects_client() {
    // a tier backend next to the stable one
    let tier_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tier_local = tier_socket.local_addr().unwrap();
    let tier_server = Arc::new(DhcpServer::new(
        "tier-backend",
        tier_local.ip(),
        tier_local.port(),
    ));

    let mut scenario = Scenario::new(ProtocolVersion::V4);
    scenario.tier = vec![tier_server];
    scenario.overrides.insert(
        "aa:bb:cc:dd:ee:ff".to_string(),
        dl_config::Override {
            tier: "canary".to_string(),
            ..Default::default()
        },
    );
    let (relay, stable_backend) = start_relay_with(scenario).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&make_v4_request(), relay.local_addr().unwrap())
        .await
        .unwrap();

    // the overridden client lands on the tier backend
    let mut buf = [0u8; 1024];
    let (n, _) = timeout(Duration::from_secs(5), tier_socket.recv_from(&mut buf))
        .await
        .expect("tier backend saw no packet")
        .unwrap();
    assert_eq!(n, make_v4_request().len());

    // and the stable backend saw nothing
    let mut buf = [0u8; 1024];
    assert!(
        timeout(Duration::from_millis(300), stable_backend.recv_from(&mut buf))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_ingress_throttle_drops_burst() {
    // on loopback the client IP and the backend IP are the same throttle
    // key, so a budget of 2/s covers exactly one ingress + egress pair
    let mut scenario = Scenario::new(ProtocolVersion::V4);
    scenario.throttle_rate = 2;
    let (relay, backend) = start_relay_with(scenario).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for _ in 0..3 {
        client
            .send_to(&make_v4_request(), relay.local_addr().unwrap())
            .await
            .unwrap();
    }

    // exactly one packet of the burst gets through; the rest were dropped
    // at ingress, so nothing arrives late either
    let mut buf = [0u8; 1024];
    timeout(Duration::from_secs(5), backend.recv_from(&mut buf))
        .await
        .expect("first packet should pass the throttle")
        .unwrap();
    assert!(
        timeout(Duration::from_millis(300), backend.recv_from(&mut buf))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_server_mode_v4_reply_goes_to_gateway() {
    // v4 replies are written to giaddr:67; binding that port needs
    // privileges, so skip where we don't have them
    let gateway = match UdpSocket::bind("127.0.0.1:67").await {
        Ok(socket) => socket,
        Err(e) => {
            eprintln!("skipping: cannot bind 127.0.0.1:67 ({e})");
            return;
        }
    };

    let mut scenario = Scenario::new(ProtocolVersion::V4);
    scenario.server_mode = true;
    scenario.handler = Some(Arc::new(StubHandler {
        reply: b"v4-reply".to_vec(),
    }));
    let (relay, backend) = start_relay_with(scenario).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut request = make_v4_request();
    request[24..28].copy_from_slice(&[127, 0, 0, 1]); // giaddr
    client
        .send_to(&request, relay.local_addr().unwrap())
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = timeout(Duration::from_secs(5), gateway.recv_from(&mut buf))
        .await
        .expect("gateway saw no handler reply")
        .unwrap();
    assert_eq!(&buf[..n], b"v4-reply");

    // in server mode nothing is forwarded to the backend pool
    let mut buf = [0u8; 1024];
    assert!(
        timeout(Duration::from_millis(300), backend.recv_from(&mut buf))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_server_mode_v6_reply_goes_to_peer() {
    // v6 replies are written to the ingress peer on port 547
    let peer_listener = match UdpSocket::bind("[::1]:547").await {
        Ok(socket) => socket,
        Err(e) => {
            eprintln!("skipping: cannot bind [::1]:547 ({e})");
            return;
        }
    };

    let mut scenario = Scenario::new(ProtocolVersion::V6);
    scenario.server_mode = true;
    scenario.handler = Some(Arc::new(StubHandler {
        reply: b"v6-reply".to_vec(),
    }));
    let (relay, backend) = start_relay_with(scenario).await;

    let client = UdpSocket::bind("[::1]:0").await.unwrap();
    client
        .send_to(&make_solicit(), relay.local_addr().unwrap())
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = timeout(Duration::from_secs(5), peer_listener.recv_from(&mut buf))
        .await
        .expect("peer saw no handler reply")
        .unwrap();
    assert_eq!(&buf[..n], b"v6-reply");

    let mut buf = [0u8; 1024];
    assert!(
        timeout(Duration::from_millis(300), backend.recv_from(&mut buf))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_v6_relayed_request_gains_a_layer() {
    let (relay, backend) = start_relay(ProtocolVersion::V6).await;

    let client = UdpSocket::bind("[::1]:0").await.unwrap();
    let inner_relay = v6::encapsulate(&make_solicit(), "fe80::268a:7ff:fe56:dca4".parse().unwrap());
    client
        .send_to(&inner_relay, relay.local_addr().unwrap())
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    let (n, _) = timeout(Duration::from_secs(5), backend.recv_from(&mut buf))
        .await
        .expect("backend saw no packet")
        .unwrap();

    let outer = v6::Packet6::parse(&buf[..n]).unwrap();
    assert_eq!(outer.msg_type(), v6::MessageType::RelayForw);
    assert_eq!(outer.hops().unwrap(), 1, "hop count follows the inner relay");
    let (recovered, _) = v6::unwind(&buf[..n]).unwrap();
    assert_eq!(recovered, &inner_relay[..]);
}
