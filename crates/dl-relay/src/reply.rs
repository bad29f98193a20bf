//! The v6 reverse path: a relay-reply from a backend is stripped of its
//! outer layer and the inner message is delivered to the peer the envelope
//! names, over a one-shot socket.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use dl_codec::v6;
use dl_config::Config;
use tokio::net::UdpSocket;
use tracing::error;

use crate::logging::LogHelper;
use crate::{ERR_CONNECT, ERR_PARSE, ERR_WRITE};

const RELAY_PORT: u16 = 547;

pub(crate) async fn handle_relay_reply(
    config: &Config,
    logger: &LogHelper,
    buf: &[u8],
    peer: SocketAddr,
    start: Instant,
) {
    let (inner, outer_peer) = match v6::unwind(buf) {
        Ok(parts) => parts,
        Err(e) => {
            error!("failed to decapsulate relay-reply from {}: {}", peer, e);
            logger.error(start, None, buf, peer, ERR_PARSE, &e);
            return;
        }
    };

    let bind_addr = match config.reply_addr {
        Some(ip) => SocketAddr::new(ip, 0),
        None => SocketAddr::from(([0u16; 8], 0)),
    };
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(socket) => socket,
        Err(e) => {
            error!("error creating reply socket on {}: {}", bind_addr, e);
            logger.error(start, None, buf, peer, ERR_CONNECT, &e);
            return;
        }
    };

    let dest = SocketAddr::new(IpAddr::V6(outer_peer), RELAY_PORT);
    if let Err(e) = socket.send_to(inner, dest).await {
        error!("error relaying reply to {}: {}", dest, e);
        logger.error(start, None, buf, peer, ERR_WRITE, &e);
        return;
    }
    logger.success(start, None, buf, peer);
}
