//! Per-client fixed routing.
//!
//! An override pins a MAC to a specific host or to a tier of servers,
//! optionally until an expiration timestamp. Host wins over tier; an
//! expired, unparseable or empty rule falls through to the balancer.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use dl_balance::DhcpServer;
use dl_codec::DhcpMessage;
use dl_config::Config;
use tracing::{error, info, warn};

/// Pick the destination for a message: overrides first, the balancer's
/// ratio-based selection otherwise.
pub async fn select_destination(
    config: &Config,
    msg: &DhcpMessage,
) -> anyhow::Result<Arc<DhcpServer>> {
    if let Some(server) = apply_override(config, msg).await? {
        return Ok(server);
    }
    Ok(config.algorithm.select_ratio_based(msg)?)
}

async fn apply_override(
    config: &Config,
    msg: &DhcpMessage,
) -> anyhow::Result<Option<Arc<DhcpServer>>> {
    let mac = msg.mac_str();
    let Some(rule) = config.overrides.get(&mac) else {
        return Ok(None);
    };

    if !rule.expiration.is_empty() {
        let Some(expiration) = rule.parse_expiration() else {
            error!(
                "could not parse override expiration {:?} for MAC {}",
                rule.expiration, mac
            );
            return Ok(None);
        };
        if Utc::now() > expiration {
            info!("override rule for MAC {} expired on {}, ignoring", mac, expiration);
            return Ok(None);
        }
        info!("found override rule for {}, expires on {}", mac, expiration);
    } else {
        info!("found override rule for {} without expiration", mac);
    }

    let server = if !rule.host.is_empty() {
        host_override(config, &rule.host)?
    } else if !rule.tier.is_empty() {
        tier_override(config, &rule.tier, msg).await?
    } else {
        warn!("override for {} has neither host nor tier, using normal selection", mac);
        return Ok(None);
    };

    // Overridden destinations are not part of any pool, so their socket is
    // opened per request and torn down once in-flight sends have drained.
    server
        .connect()
        .await
        .with_context(|| format!("connecting to override server {server}"))?;
    schedule_disconnect(server.clone(), config.free_conn_timeout);
    Ok(Some(server))
}

fn host_override(config: &Config, host: &str) -> anyhow::Result<Arc<DhcpServer>> {
    let address: IpAddr = match host.parse() {
        Ok(ip) => ip,
        Err(_) => bail!("failed to get IP for overridden host {host}"),
    };
    Ok(Arc::new(DhcpServer::new(
        host,
        address,
        config.version.server_port(),
    )))
}

async fn tier_override(
    config: &Config,
    tier: &str,
    msg: &DhcpMessage,
) -> anyhow::Result<Arc<DhcpServer>> {
    let servers = config
        .host_sourcer
        .servers_in_tier(tier)
        .await
        .with_context(|| format!("failed to get servers from tier {tier}"))?;
    if servers.is_empty() {
        bail!("sourcer returned no servers for tier {tier}");
    }
    Ok(config.algorithm.select_from_list(&servers, msg)?)
}

/// Close a one-shot connection after the configured grace period.
pub(crate) fn schedule_disconnect(server: Arc<DhcpServer>, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        server.disconnect().await;
    });
}
