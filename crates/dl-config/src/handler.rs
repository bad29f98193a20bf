//! Server mode: instead of forwarding, hand the packet to an external
//! handler that synthesizes the reply. Deployments supply an
//! implementation through their `ConfigProvider`.

use async_trait::async_trait;
use thiserror::Error;

/// Why a handler declined to produce a reply. `kind` is carried into the
/// request log verbatim, so handlers can define their own error taxonomy.
#[derive(Debug, Error)]
#[error("{kind}: {detail}")]
pub struct HandlerError {
    pub kind: String,
    pub detail: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: detail.into(),
        }
    }
}

/// Synchronously produce a reply for a parsed-as-valid request packet.
/// Replies are delivered by the dispatcher: v4 to the packet's gateway
/// address on port 67, v6 to the ingress peer on port 547. No retries.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve_v4(&self, packet: &[u8]) -> Result<Vec<u8>, HandlerError>;

    async fn serve_v6(&self, packet: &[u8]) -> Result<Vec<u8>, HandlerError>;
}
