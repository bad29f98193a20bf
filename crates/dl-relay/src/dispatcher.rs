//! The packet dispatcher: one task reads datagrams off the listening
//! socket, each datagram is handled by its own panic-isolated worker task.
//!
//! A worker may fail in many ways (malformed packet, no backend, throttled,
//! socket error, a bug); every failure becomes one structured log record
//! plus a dropped packet, never a crashed process. The receive buffer is
//! returned to the pool on every path, panics included.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use dl_balance::DhcpServer;
use dl_codec::v4::vendor::vendor_data;
use dl_codec::v4::Packet4;
use dl_codec::v6::{MessageType, Packet6, OPT_CLIENT_ID};
use dl_codec::{v4, v6, CodecError, DhcpMessage, ProtocolVersion};
use dl_config::{ConfigStore, Handler};
use dl_throttle::Throttle;
use futures_util::FutureExt;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{error, info};

use crate::logging::LogHelper;
use crate::override_engine::select_destination;
use crate::pool::BufferPool;
use crate::update::ServerPools;
use crate::{reply, ERR_ADMISSION, ERR_CONNECT, ERR_NO_SERVER, ERR_PANIC, ERR_PARSE, ERR_READ, ERR_WRITE};

pub struct RelayServer {
    version: ProtocolVersion,
    server_mode: bool,
    socket: UdpSocket,
    store: Arc<ConfigStore>,
    pools: Arc<ServerPools>,
    buffers: BufferPool,
    throttle: Arc<Throttle>,
    logger: Arc<LogHelper>,
    handler: Option<Arc<dyn Handler>>,
}

impl RelayServer {
    /// Bind the listening socket described by the current config snapshot.
    /// Failure here is a startup failure.
    pub fn bind(
        store: Arc<ConfigStore>,
        pools: Arc<ServerPools>,
        throttle: Arc<Throttle>,
        logger: Arc<LogHelper>,
        handler: Option<Arc<dyn Handler>>,
        server_mode: bool,
    ) -> anyhow::Result<Arc<Self>> {
        let config = store.get();
        let socket = bind_udp(config.listen_addr)
            .with_context(|| format!("binding listener on {}", config.listen_addr))?;
        Ok(Arc::new(Self {
            version: config.version,
            server_mode,
            socket,
            store,
            pools,
            buffers: BufferPool::new(config.packet_buf_size),
            throttle,
            logger,
            handler,
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn has_servers(&self) -> bool {
        self.pools.has_servers().await
    }

    /// The read loop. Never returns under normal operation.
    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        info!(
            "processing {} DHCP requests on {}",
            self.version,
            self.socket.local_addr()?
        );
        loop {
            let mut buf = self.buffers.get().await;
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok((0, peer)) => {
                    error!("read zero bytes from {}", peer);
                    self.logger
                        .error(Instant::now(), None, &[], peer, ERR_READ, &"empty datagram");
                    self.buffers.put(buf).await;
                    continue;
                }
                Ok(read) => read,
                Err(e) => {
                    error!("error reading from listener: {}", e);
                    let unknown = SocketAddr::new(IpAddr::from([0, 0, 0, 0]), 0);
                    self.logger
                        .error(Instant::now(), None, &[], unknown, ERR_READ, &e);
                    self.buffers.put(buf).await;
                    continue;
                }
            };

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                let start = Instant::now();
                let work = std::panic::AssertUnwindSafe(
                    this.handle_packet(&mut buf[..len], peer, start),
                )
                .catch_unwind();
                if let Err(panic) = work.await {
                    let detail = panic_message(panic.as_ref());
                    error!(
                        "panicked handling {} packet from {}: {}",
                        this.version, peer, detail
                    );
                    error!("offending packet: {}", hex_string(&buf[..len]));
                    this.logger
                        .error(start, None, &buf[..len], peer, ERR_PANIC, &detail);
                }
                this.buffers.put(buf).await;
            });
        }
    }

    async fn handle_packet(&self, buf: &mut [u8], peer: SocketAddr, start: Instant) {
        // ingress throttle, keyed by the relay that sent us the packet
        if let Err(e) = self.throttle.ok(&peer.ip().to_string()) {
            error!("dropping packet from {}: {}", peer, e);
            self.logger.error(start, None, buf, peer, ERR_ADMISSION, &e);
            return;
        }
        match self.version {
            ProtocolVersion::V4 => self.handle_v4(buf, peer, start).await,
            ProtocolVersion::V6 => self.handle_v6(buf, peer, start).await,
        }
    }

    async fn handle_v4(&self, buf: &mut [u8], peer: SocketAddr, start: Instant) {
        let config = self.store.get();

        let message = match Packet4::parse(buf) {
            Ok(packet) => {
                if self.server_mode {
                    if let Some(handler) = self.handler.clone() {
                        self.serve_v4_handler(&handler, buf, peer, start).await;
                        return;
                    }
                }
                message_from_v4(&packet, peer)
            }
            Err(e) => {
                error!("error parsing v4 packet from {}: {}", peer, e);
                self.logger.error(start, None, buf, peer, ERR_PARSE, &e);
                return;
            }
        };

        v4::increment_hops(buf);

        let server = match select_destination(&config, &message).await {
            Ok(server) => server,
            Err(e) => {
                error!("xid {:#010x} from {}: drop due to {:#}", message.xid, peer, e);
                self.logger.error(start, None, buf, peer, ERR_NO_SERVER, &e);
                return;
            }
        };

        self.send_to_server(&server, buf, peer, start).await;
    }

    async fn handle_v6(&self, buf: &mut [u8], peer: SocketAddr, start: Instant) {
        let config = self.store.get();

        let packet = match Packet6::parse(buf) {
            Ok(packet) => packet,
            Err(e) => {
                error!("error parsing v6 packet from {}: {}", peer, e);
                self.logger.error(start, None, buf, peer, ERR_PARSE, &e);
                return;
            }
        };

        if self.server_mode {
            if let Some(handler) = self.handler.clone() {
                self.serve_v6_handler(&handler, buf, peer, start).await;
                return;
            }
        }

        if packet.msg_type() == MessageType::RelayRepl {
            reply::handle_relay_reply(&config, &self.logger, buf, peer, start).await;
            return;
        }

        let message = match build_message_v6(&packet, peer) {
            Ok(message) => message,
            Err(e) => {
                error!("error extracting v6 fields from {}: {}", peer, e);
                self.logger.error(start, None, buf, peer, ERR_PARSE, &e);
                return;
            }
        };

        let server = match select_destination(&config, &message).await {
            Ok(server) => server,
            Err(e) => {
                error!("xid {:#08x} from {}: drop due to {:#}", message.xid, peer, e);
                self.logger.error(start, None, buf, peer, ERR_NO_SERVER, &e);
                return;
            }
        };

        let peer_ip = match peer.ip() {
            IpAddr::V6(ip) => ip,
            IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        };
        let wrapped = v6::encapsulate(buf, peer_ip);
        self.send_to_server(&server, &wrapped, peer, start).await;
    }

    async fn send_to_server(
        &self,
        server: &Arc<DhcpServer>,
        packet: &[u8],
        peer: SocketAddr,
        start: Instant,
    ) {
        // egress throttle, keyed by the chosen backend
        if let Err(e) = self.throttle.ok(&server.address.to_string()) {
            error!("dropping packet to {}: {}", server, e);
            self.logger
                .error(start, Some(server), packet, peer, ERR_ADMISSION, &e);
            return;
        }
        if let Err(e) = server.send(packet).await {
            error!("error writing to {}: {}", server, e);
            self.logger
                .error(start, Some(server), packet, peer, ERR_WRITE, &e);
            return;
        }
        self.logger.success(start, Some(server), packet, peer);
    }

    async fn serve_v4_handler(
        &self,
        handler: &Arc<dyn Handler>,
        buf: &[u8],
        peer: SocketAddr,
        start: Instant,
    ) {
        let reply_packet = match handler.serve_v4(buf).await {
            Ok(reply_packet) => reply_packet,
            Err(e) => {
                error!("handler failed for v4 packet from {}: {}", peer, e);
                self.logger
                    .error(start, None, buf, peer, &e.kind, &e.detail);
                return;
            }
        };
        // v4 replies go back through the gateway that relayed the request
        let giaddr = match Packet4::parse(buf) {
            Ok(packet) => packet.giaddr(),
            Err(e) => {
                self.logger.error(start, None, buf, peer, ERR_PARSE, &e);
                return;
            }
        };
        let dest = SocketAddr::new(IpAddr::V4(giaddr), 67);
        self.send_handler_reply(&reply_packet, dest, buf, peer, start)
            .await;
    }

    async fn serve_v6_handler(
        &self,
        handler: &Arc<dyn Handler>,
        buf: &[u8],
        peer: SocketAddr,
        start: Instant,
    ) {
        let reply_packet = match handler.serve_v6(buf).await {
            Ok(reply_packet) => reply_packet,
            Err(e) => {
                error!("handler failed for v6 packet from {}: {}", peer, e);
                self.logger
                    .error(start, None, buf, peer, &e.kind, &e.detail);
                return;
            }
        };
        let dest = SocketAddr::new(peer.ip(), 547);
        self.send_handler_reply(&reply_packet, dest, buf, peer, start)
            .await;
    }

    async fn send_handler_reply(
        &self,
        reply_packet: &[u8],
        dest: SocketAddr,
        request: &[u8],
        peer: SocketAddr,
        start: Instant,
    ) {
        let bind_addr: SocketAddr = if dest.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                error!("error creating reply socket: {}", e);
                self.logger
                    .error(start, None, request, peer, ERR_CONNECT, &e);
                return;
            }
        };
        if let Err(e) = socket.send_to(reply_packet, dest).await {
            error!("error sending handler reply to {}: {}", dest, e);
            self.logger.error(start, None, request, peer, ERR_WRITE, &e);
            return;
        }
        self.logger.success(start, None, request, peer);
    }
}

fn bind_udp(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

fn message_from_v4(packet: &Packet4<'_>, peer: SocketAddr) -> DhcpMessage {
    let client_id = packet.chaddr().to_vec();
    DhcpMessage {
        xid: packet.xid(),
        peer,
        mac: client_id.clone(),
        client_id,
        net_boot: packet.is_net_boot(),
        vendor: vendor_data(packet),
    }
}

fn build_message_v6(packet: &Packet6<'_>, peer: SocketAddr) -> Result<DhcpMessage, CodecError> {
    let inner = packet.inner_message()?;
    let duid = inner.option(OPT_CLIENT_ID)?;
    Ok(DhcpMessage {
        xid: packet.xid()?,
        peer,
        client_id: duid.to_vec(),
        mac: packet.mac()?,
        net_boot: packet.is_net_boot(),
        vendor: Default::default(),
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_string() {
        assert_eq!(hex_string(&[0x01, 0xab, 0xff]), "01abff");
        assert_eq!(hex_string(&[]), "");
    }

    #[test]
    fn test_message_from_v4() {
        let mut pkt = vec![0u8; 240];
        pkt[0] = 1;
        pkt[2] = 6;
        pkt[4..8].copy_from_slice(&0xdeadbeefu32.to_be_bytes());
        pkt[28..34].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        pkt[236..240].copy_from_slice(&v4::MAGIC_COOKIE);

        let peer: SocketAddr = "192.0.2.1:67".parse().unwrap();
        let message = message_from_v4(&Packet4::parse(&pkt).unwrap(), peer);
        assert_eq!(message.xid, 0xdeadbeef);
        assert_eq!(message.mac, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(message.client_id, message.mac);
        assert_eq!(message.mac_str(), "01:02:03:04:05:06");
        assert!(!message.net_boot);
    }

    #[test]
    fn test_build_message_v6_requires_client_id() {
        let pkt = [MessageType::Solicit as u8, 0, 0, 1];
        let packet = Packet6::parse(&pkt).unwrap();
        let peer: SocketAddr = "[fe80::1]:547".parse().unwrap();
        assert!(matches!(
            build_message_v6(&packet, peer),
            Err(CodecError::MissingOption(OPT_CLIENT_ID))
        ));
    }
}
