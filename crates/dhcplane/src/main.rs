mod diag;
mod json_logger;
mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use dl_codec::ProtocolVersion;
use dl_config::{watcher, Config, ConfigProvider, ConfigStore, DefaultConfigProvider};
use dl_relay::update::{apply_config, run_reconciler};
use dl_relay::{LogHelper, RelayServer, ServerPools};
use dl_throttle::Throttle;
use supervisor::{spawn_supervised, ServicePriority};
use tracing::{error, info};

/// DHCPv4/v6 relay and load balancer.
#[derive(Parser, Debug)]
#[command(name = "dhcplane", disable_version_flag = true)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Path to the JSON overrides file; omit to disable overrides.
    #[arg(long)]
    overrides: Option<PathBuf>,

    /// Protocol mode, 4 or 6.
    #[arg(long, default_value_t = 4)]
    version: u8,

    /// Serve replies through the built-in handler instead of relaying.
    #[arg(long)]
    server: bool,

    /// Diagnostics HTTP port; 0 disables the endpoint.
    #[arg(long, default_value_t = 0)]
    pprof: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let Some(version) = ProtocolVersion::from_number(args.version) else {
        bail!("supported versions: 4, 6 - not {}", args.version);
    };

    // ── Initial configuration ──────────────────────────────────────────

    let provider = Arc::new(DefaultConfigProvider);
    let config = Config::load(
        &args.config,
        args.overrides.as_deref(),
        version,
        &*provider,
    )
    .context("failed to load config")?;

    info!(
        "setting up throttle: cache size {} - cache rate {} - request rate {}",
        config.cache_size, config.cache_rate, config.rate
    );
    let throttle = Arc::new(
        Throttle::new(config.cache_size, config.cache_rate, config.rate)
            .context("failed to create throttle")?,
    );

    let store = Arc::new(ConfigStore::new(Arc::new(config)));
    let pools = Arc::new(ServerPools::new());
    let logger = Arc::new(LogHelper::new(
        version,
        Some(Arc::new(json_logger::JsonLogger)),
    ));

    // The provider seam supplies the server-mode handler; the default
    // provider has none, so --server refuses to start here. Deployments
    // wire their own provider (and handler) into their own binary.
    let handler = provider.handler();
    if args.server && handler.is_none() {
        bail!("server mode requires a handler implementation, none is configured");
    }

    let relay = RelayServer::bind(
        store.clone(),
        pools.clone(),
        throttle.clone(),
        logger,
        handler,
        args.server,
    )?;
    info!("starting dhcplane in {} mode on {}", version, relay.local_addr()?);

    // ── Config watching ────────────────────────────────────────────────

    let (mut config_rx, mut config_err_rx) = watcher::watch_config(
        args.config.clone(),
        args.overrides.clone(),
        version,
        provider,
    );

    {
        let store = store.clone();
        let pools = pools.clone();
        let throttle = throttle.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(config) = config_rx.recv() => {
                        info!("config changed");
                        apply_config(&store, &pools, &throttle, config).await;
                    }
                    Some(e) = config_err_rx.recv() => {
                        // refuse to keep running against an unparseable config
                        error!("failed to reload config: {e:#}");
                        std::process::exit(1);
                    }
                    else => break,
                }
            }
        });
    }

    // ── Supervised services ────────────────────────────────────────────

    {
        let store = store.clone();
        let pools = pools.clone();
        spawn_supervised("reconciler", ServicePriority::Important, move || {
            let store = store.clone();
            let pools = pools.clone();
            async move { run_reconciler(store, pools).await }
        });
    }

    if args.pprof != 0 {
        let state = diag::DiagState {
            store: store.clone(),
            pools: pools.clone(),
            throttle: throttle.clone(),
        };
        let port = args.pprof;
        spawn_supervised("diag", ServicePriority::Important, move || {
            let state = state.clone();
            async move { diag::run_diag_server(port, state).await }
        });
    }

    {
        let relay = relay.clone();
        spawn_supervised("dispatcher", ServicePriority::Critical, move || {
            let relay = relay.clone();
            async move { relay.serve().await }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
