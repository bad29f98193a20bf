//! Operator diagnostics over HTTP, enabled with `--pprof PORT`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use dl_config::ConfigStore;
use dl_relay::ServerPools;
use dl_throttle::Throttle;
use serde_json::{json, Value};
use tracing::info;

#[derive(Clone)]
pub struct DiagState {
    pub store: Arc<ConfigStore>,
    pub pools: Arc<ServerPools>,
    pub throttle: Arc<Throttle>,
}

pub async fn run_diag_server(port: u16, state: DiagState) -> anyhow::Result<()> {
    let router = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state);

    let addr: SocketAddr = format!("[::]:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("diagnostics endpoint listening on {}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn status(State(state): State<DiagState>) -> Json<Value> {
    let config = state.store.get();
    Json(json!({
        "version": config.version.number(),
        "listen_addr": config.listen_addr.to_string(),
        "algorithm": config.algorithm.name(),
        "rc_ratio": config.rc_ratio,
        "stable_servers": state.pools.stable_snapshot().await.len(),
        "rc_servers": state.pools.rc_snapshot().await.len(),
        "throttle_keys": state.throttle.len(),
        "throttle_disabled": state.throttle.is_disabled(),
    }))
}
