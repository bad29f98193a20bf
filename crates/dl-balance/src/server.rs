//! A backend DHCP server and the pool reconciliation helpers.
//!
//! Each server owns at most one connected UDP socket. Reloads are diffs
//! keyed by `(address, port)`: surviving entries inherit their socket so a
//! list update never interrupts in-flight traffic.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct DhcpServer {
    pub hostname: String,
    pub address: IpAddr,
    pub port: u16,
    pub is_rc: bool,
    conn: Mutex<Option<Arc<UdpSocket>>>,
}

impl DhcpServer {
    pub fn new(hostname: impl Into<String>, address: IpAddr, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            address,
            port,
            is_rc: false,
            conn: Mutex::new(None),
        }
    }

    pub fn rc(hostname: impl Into<String>, address: IpAddr, port: u16) -> Self {
        Self {
            is_rc: true,
            ..Self::new(hostname, address, port)
        }
    }

    fn key(&self) -> (String, u16) {
        (self.address.to_string(), self.port)
    }

    fn bind_addr(&self) -> SocketAddr {
        match self.address {
            IpAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            IpAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        }
    }

    /// Open the connected socket if it is not open already.
    pub async fn connect(&self) -> io::Result<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            info!("opening connection to {}", self);
            let socket = UdpSocket::bind(self.bind_addr()).await?;
            socket.connect((self.address, self.port)).await?;
            *conn = Some(Arc::new(socket));
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut conn = self.conn.lock().await;
        if conn.take().is_some() {
            info!("closing connection to {}", self);
        }
    }

    /// Drop the current socket and dial a fresh one.
    async fn reconnect(&self) -> io::Result<Arc<UdpSocket>> {
        let mut conn = self.conn.lock().await;
        let socket = UdpSocket::bind(self.bind_addr()).await?;
        socket.connect((self.address, self.port)).await?;
        let socket = Arc::new(socket);
        *conn = Some(socket.clone());
        Ok(socket)
    }

    pub async fn connection(&self) -> Option<Arc<UdpSocket>> {
        self.conn.lock().await.clone()
    }

    /// Inherit an already-open socket. No-op when one is open already.
    pub async fn adopt_connection(&self, socket: Arc<UdpSocket>) {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(socket);
        }
    }

    /// Send one datagram, reconnecting and retrying exactly once when the
    /// first write fails (absorbs the race with a concurrent socket close).
    pub async fn send(&self, packet: &[u8]) -> io::Result<()> {
        let socket = self.connection().await.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("no connection open to {self}"),
            )
        })?;
        if let Err(e) = socket.send(packet).await {
            warn!("send to {} failed ({}), reconnecting once", self, e);
            let socket = self.reconnect().await?;
            socket.send(packet).await?;
        }
        Ok(())
    }
}

impl std::fmt::Display for DhcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_rc {
            write!(f, "{}:{} (RC)", self.hostname, self.port)
        } else {
            write!(f, "{}:{}", self.hostname, self.port)
        }
    }
}

/// Set difference between two server lists, keyed by `(address, port)`.
/// Returns `(added, removed)`.
pub fn diff_server_lists(
    original: &[Arc<DhcpServer>],
    updated: &[Arc<DhcpServer>],
) -> (Vec<Arc<DhcpServer>>, Vec<Arc<DhcpServer>>) {
    let original_keys: rustc_hash::FxHashSet<_> = original.iter().map(|s| s.key()).collect();
    let updated_keys: rustc_hash::FxHashSet<_> = updated.iter().map(|s| s.key()).collect();

    let added = updated
        .iter()
        .filter(|s| !original_keys.contains(&s.key()))
        .cloned()
        .collect();
    let removed = original
        .iter()
        .filter(|s| !updated_keys.contains(&s.key()))
        .cloned()
        .collect();
    (added, removed)
}

/// Move open sockets from an old list onto its replacement and dial the
/// entries that have none. A failed dial is logged and skipped so one dead
/// backend cannot block a reload.
pub async fn carry_over_connections(original: &[Arc<DhcpServer>], updated: &[Arc<DhcpServer>]) {
    let mut open: FxHashMap<(String, u16), Arc<UdpSocket>> = FxHashMap::default();
    for server in original {
        if let Some(conn) = server.connection().await {
            open.insert(server.key(), conn);
        }
    }
    for server in updated {
        match open.remove(&server.key()) {
            Some(conn) => server.adopt_connection(conn).await,
            None => {
                if let Err(e) = server.connect().await {
                    warn!("unable to open socket to {}: {}", server, e);
                }
            }
        }
    }
}
