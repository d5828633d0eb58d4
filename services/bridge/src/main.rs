// bridge: Receives glucose telemetry from a data source and stores the
// validated readings.
//
// Wires together the SQLite store, the TCP source binding, the bridge
// service loop and the control API, then waits for a shutdown signal.

use std::path::{Path, PathBuf};

use bridge::config::{DEFAULT_CONFIG_PATH, load_config_from_path};
use bridge::control_api;
use bridge::store::SqliteStore;
use bridge::tcp_source::TcpSource;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse optional --config <path> argument.
    let args: Vec<String> = std::env::args().collect();
    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) => match args.get(i + 1) {
            Some(p) => PathBuf::from(p),
            None => {
                eprintln!("FATAL: --config requires a path argument");
                std::process::exit(1);
            }
        },
        None => PathBuf::from(DEFAULT_CONFIG_PATH),
    };

    let cfg = match load_config_from_path(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    // RUST_LOG wins; otherwise debug_logging picks the default level.
    let default_level = if cfg.bridge.debug_logging {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        source = %cfg.source.address,
        client_id = %cfg.source.client_id,
        enabled = cfg.bridge.enabled,
        "bridge starting"
    );

    let store = match SqliteStore::open(Path::new(&cfg.store.sqlite_path)) {
        Ok(store) => {
            info!(path = %cfg.store.sqlite_path, "glucose store opened");
            store
        }
        Err(e) => {
            eprintln!("FATAL: failed to open glucose store: {e}");
            std::process::exit(1);
        }
    };

    let source = TcpSource::new(cfg.source.address.clone(), cfg.source.client_id.clone());
    let (handle, bridge_task) = bridge::spawn_bridge(cfg.bridge.clone(), source, store);

    let api_task = match control_api::serve(&cfg.control_api.bind, handle.clone()).await {
        Ok((_, task)) => task,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };

    wait_for_shutdown_signal().await;

    if handle.shutdown().await.is_err() {
        error!("bridge already stopped before shutdown");
    }
    if let Err(e) = bridge_task.await {
        error!(error = %e, "bridge task ended abnormally");
    }
    api_task.abort();
    info!("bridge exited");
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown: SIGINT received"),
            _ = sigterm.recv() => info!("shutdown: SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown: Ctrl-C received");
    }
}
