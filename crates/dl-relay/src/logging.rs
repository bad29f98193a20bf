//! Structured per-request records.
//!
//! The relay emits one record per handled packet through a pluggable
//! `RequestLogger`; the default sink in the binary turns them into JSON
//! lines. A sink failure is itself logged but never fails the request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dl_balance::DhcpServer;
use dl_codec::ProtocolVersion;

#[derive(Debug, Clone)]
pub struct LogMessage {
    pub version: ProtocolVersion,
    /// Raw packet bytes, empty when the read itself failed.
    pub packet: Vec<u8>,
    pub peer: SocketAddr,
    /// Hostname of the chosen backend, empty when none was selected.
    pub server: String,
    pub server_is_rc: bool,
    pub latency: Duration,
    pub success: bool,
    pub error_name: String,
    pub error_details: String,
}

pub trait RequestLogger: Send + Sync {
    fn log(&self, msg: &LogMessage) -> anyhow::Result<()>;
}

/// Fills in the success/error shape of a record and shields the request
/// path from sink failures.
pub struct LogHelper {
    version: ProtocolVersion,
    logger: Option<Arc<dyn RequestLogger>>,
}

impl LogHelper {
    pub fn new(version: ProtocolVersion, logger: Option<Arc<dyn RequestLogger>>) -> Self {
        Self { version, logger }
    }

    pub fn success(
        &self,
        start: Instant,
        server: Option<&DhcpServer>,
        packet: &[u8],
        peer: SocketAddr,
    ) {
        self.emit(start, server, packet, peer, true, String::new(), String::new());
    }

    pub fn error(
        &self,
        start: Instant,
        server: Option<&DhcpServer>,
        packet: &[u8],
        peer: SocketAddr,
        error_name: &str,
        error_details: &dyn std::fmt::Display,
    ) {
        self.emit(
            start,
            server,
            packet,
            peer,
            false,
            error_name.to_string(),
            error_details.to_string(),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        start: Instant,
        server: Option<&DhcpServer>,
        packet: &[u8],
        peer: SocketAddr,
        success: bool,
        error_name: String,
        error_details: String,
    ) {
        let Some(logger) = &self.logger else {
            return;
        };
        let msg = LogMessage {
            version: self.version,
            packet: packet.to_vec(),
            peer,
            server: server.map(|s| s.hostname.clone()).unwrap_or_default(),
            server_is_rc: server.map(|s| s.is_rc).unwrap_or(false),
            latency: start.elapsed(),
            success,
            error_name,
            error_details,
        };
        if let Err(e) = logger.log(&msg) {
            tracing::error!("failed to log request: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CapturingLogger {
        records: Mutex<Vec<LogMessage>>,
    }

    impl RequestLogger for CapturingLogger {
        fn log(&self, msg: &LogMessage) -> anyhow::Result<()> {
            self.records.lock().unwrap().push(msg.clone());
            Ok(())
        }
    }

    #[test]
    fn test_success_and_error_records() {
        let sink = Arc::new(CapturingLogger {
            records: Mutex::new(Vec::new()),
        });
        let helper = LogHelper::new(ProtocolVersion::V4, Some(sink.clone()));
        let peer: SocketAddr = "10.1.2.3:68".parse().unwrap();
        let server = DhcpServer::rc("backend", "10.0.0.1".parse().unwrap(), 67);

        helper.success(Instant::now(), Some(&server), b"pkt", peer);
        helper.error(Instant::now(), None, b"pkt", peer, crate::ERR_PARSE, &"boom");

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].success);
        assert_eq!(records[0].server, "backend");
        assert!(records[0].server_is_rc);
        assert!(!records[1].success);
        assert_eq!(records[1].error_name, "Parse");
        assert_eq!(records[1].error_details, "boom");
        assert!(records[1].server.is_empty());
    }

    #[test]
    fn test_sink_failure_does_not_propagate() {
        struct FailingLogger;
        impl RequestLogger for FailingLogger {
            fn log(&self, _msg: &LogMessage) -> anyhow::Result<()> {
                anyhow::bail!("sink is down")
            }
        }
        let helper = LogHelper::new(ProtocolVersion::V6, Some(Arc::new(FailingLogger)));
        let peer: SocketAddr = "[fe80::1]:547".parse().unwrap();
        helper.success(Instant::now(), None, b"pkt", peer);
    }
}
