//! Configuration: JSON spec files, per-MAC overrides, the atomically
//! swappable snapshot store, and the file watcher that feeds it.

pub mod handler;
pub mod store;
pub mod watcher;

pub use handler::{Handler, HandlerError};
pub use store::ConfigStore;

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, FixedOffset, Utc};
use dl_balance::{algorithm_by_name, BalancingAlgorithm, FileSourcer, HostSourcer};
use dl_codec::ProtocolVersion;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::info;

/// Format override expirations are written in, e.g.
/// `2017/05/06 14:00 +0000`.
pub const EXPIRATION_FORMAT: &str = "%Y/%m/%d %H:%M %z";

/// Hook for deployments that plug in their own host sourcer, server-mode
/// handler, or interpretation of the opaque `extras` section. The built-in
/// `file:` sourcer bypasses it.
pub trait ConfigProvider: Send + Sync {
    /// Build a sourcer for a non-`file` `host_sourcer` spec, e.g.
    /// `"inventory:region=foo"` arrives as `("inventory", "region=foo")`.
    fn host_sourcer(
        &self,
        kind: &str,
        args: &str,
        version: ProtocolVersion,
    ) -> anyhow::Result<Option<Arc<dyn HostSourcer>>>;

    /// Interpret the `extras` JSON. The default keeps it untouched.
    fn parse_extras(
        &self,
        raw: Option<&serde_json::Value>,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(raw.cloned())
    }

    /// The handler invoked in server mode. The default provider has none,
    /// so server mode refuses to start unless a deployment supplies one.
    fn handler(&self) -> Option<Arc<dyn Handler>> {
        None
    }
}

/// Provider with no custom sourcers and pass-through extras.
pub struct DefaultConfigProvider;

impl ConfigProvider for DefaultConfigProvider {
    fn host_sourcer(
        &self,
        _kind: &str,
        _args: &str,
        _version: ProtocolVersion,
    ) -> anyhow::Result<Option<Arc<dyn HostSourcer>>> {
        Ok(None)
    }
}

/// One version's worth of raw JSON configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigSpec {
    #[serde(default)]
    pub version: u8,
    #[serde(default)]
    pub listen_addr: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub algorithm: String,
    #[serde(default = "default_update_interval")]
    pub update_server_interval: u64,
    #[serde(default = "default_packet_buf_size")]
    pub packet_buf_size: usize,
    #[serde(default)]
    pub host_sourcer: String,
    #[serde(default = "default_free_conn_timeout")]
    pub free_conn_timeout: u64,
    #[serde(default)]
    pub rc_ratio: u32,
    #[serde(default)]
    pub extras: Option<serde_json::Value>,
    #[serde(default)]
    pub throttle_cache_size: i64,
    #[serde(default)]
    pub throttle_cache_rate: i64,
    #[serde(default)]
    pub throttle_rate: i64,
    #[serde(default)]
    pub reply_addr: String,
}

fn default_update_interval() -> u64 {
    30
}

fn default_packet_buf_size() -> usize {
    1024
}

fn default_free_conn_timeout() -> u64 {
    30
}

#[derive(Debug, Default, Deserialize)]
struct CombinedSpec {
    #[serde(default)]
    v4: ConfigSpec,
    #[serde(default)]
    v6: ConfigSpec,
}

/// Routing rule pinning one MAC to a host or a tier. Host wins over tier;
/// an expired entry behaves like a miss.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Override {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub expiration: String,
}

impl Override {
    pub fn parse_expiration(&self) -> Option<DateTime<FixedOffset>> {
        if self.expiration.is_empty() {
            return None;
        }
        DateTime::parse_from_str(&self.expiration, EXPIRATION_FORMAT).ok()
    }

    /// True when an expiration is set and already in the past. A set but
    /// unparseable expiration is reported through `parse_expiration`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.parse_expiration() {
            Some(expiration) => now > expiration,
            None => false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct OverridesFile {
    #[serde(default)]
    v4: FxHashMap<String, Override>,
    #[serde(default)]
    v6: FxHashMap<String, Override>,
}

/// The runtime configuration snapshot. Replaced wholesale on reload and
/// never mutated; a request takes one `Arc<Config>` and uses it throughout.
pub struct Config {
    pub version: ProtocolVersion,
    pub listen_addr: SocketAddr,
    pub algorithm: Arc<dyn BalancingAlgorithm>,
    pub update_server_interval: Duration,
    pub packet_buf_size: usize,
    pub host_sourcer: Arc<dyn HostSourcer>,
    pub free_conn_timeout: Duration,
    pub rc_ratio: u32,
    pub overrides: FxHashMap<String, Override>,
    pub cache_size: i64,
    pub cache_rate: i64,
    pub rate: i64,
    pub reply_addr: Option<IpAddr>,
    pub extras: Option<serde_json::Value>,
}

impl Config {
    /// Load and validate the configuration for one protocol version.
    /// Every failure here is fatal, at boot and on reload alike: the
    /// process refuses to run with a partially-parsed config.
    pub fn load(
        config_path: &Path,
        overrides_path: Option<&Path>,
        version: ProtocolVersion,
        provider: &dyn ConfigProvider,
    ) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(config_path)
            .with_context(|| format!("reading config {}", config_path.display()))?;
        let combined: CombinedSpec = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", config_path.display()))?;
        let spec = match version {
            ProtocolVersion::V4 => combined.v4,
            ProtocolVersion::V6 => combined.v6,
        };

        let overrides = load_overrides(overrides_path, version)?;
        info!("loaded {} override(s)", overrides.len());

        Config::from_spec(spec, overrides, version, provider)
    }

    fn from_spec(
        spec: ConfigSpec,
        overrides: FxHashMap<String, Override>,
        version: ProtocolVersion,
        provider: &dyn ConfigProvider,
    ) -> anyhow::Result<Config> {
        if spec.version != version.number() {
            bail!(
                "config section declares version {}, process runs {}",
                spec.version,
                version
            );
        }

        let ip: IpAddr = spec
            .listen_addr
            .parse()
            .with_context(|| format!("unable to parse listen_addr {:?}", spec.listen_addr))?;
        let listen_addr = SocketAddr::new(ip, spec.port);

        let algorithm = algorithm_by_name(&spec.algorithm, spec.rc_ratio)?;
        let host_sourcer = build_sourcer(&spec.host_sourcer, version, provider)?;
        let extras = provider.parse_extras(spec.extras.as_ref())?;

        let reply_addr = if spec.reply_addr.is_empty() {
            None
        } else {
            Some(spec.reply_addr.parse().with_context(|| {
                format!("unable to parse reply_addr {:?}", spec.reply_addr)
            })?)
        };

        Ok(Config {
            version,
            listen_addr,
            algorithm,
            update_server_interval: Duration::from_secs(spec.update_server_interval),
            packet_buf_size: spec.packet_buf_size,
            host_sourcer,
            free_conn_timeout: Duration::from_secs(spec.free_conn_timeout),
            rc_ratio: spec.rc_ratio,
            overrides,
            cache_size: spec.throttle_cache_size,
            cache_rate: spec.throttle_cache_rate,
            rate: spec.throttle_rate,
            reply_addr,
            extras,
        })
    }
}

/// `host_sourcer` spec grammar: `kind:args`, where the builtin `file` kind
/// takes `STABLE[,RC]` file paths. Anything else goes to the provider.
fn build_sourcer(
    spec: &str,
    version: ProtocolVersion,
    provider: &dyn ConfigProvider,
) -> anyhow::Result<Arc<dyn HostSourcer>> {
    let (kind, args) = spec
        .split_once(':')
        .with_context(|| format!("host_sourcer {:?} is not of the form kind:args", spec))?;

    if kind == "file" {
        let (stable, rc) = match args.split_once(',') {
            Some((stable, rc)) => (stable, Some(rc.into())),
            None => (args, None),
        };
        return Ok(Arc::new(FileSourcer::new(stable, rc, version)));
    }

    provider
        .host_sourcer(kind, args, version)?
        .with_context(|| format!("no host sourcer available for kind {:?}", kind))
}

fn load_overrides(
    path: Option<&Path>,
    version: ProtocolVersion,
) -> anyhow::Result<FxHashMap<String, Override>> {
    // no overrides file means overrides are disabled
    let Some(path) = path else {
        return Ok(FxHashMap::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading overrides {}", path.display()))?;
    let parsed: OverridesFile = serde_json::from_str(&raw)
        .with_context(|| format!("parsing overrides {}", path.display()))?;
    Ok(match version {
        ProtocolVersion::V4 => parsed.v4,
        ProtocolVersion::V6 => parsed.v6,
    })
}
