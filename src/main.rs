use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use crisislog::{EventStore, FileStorage, LogDispatcher, ReplaySettings, StoreConfig};
use tokio::sync::broadcast;

/// Server configuration parsed from environment variables.
///
/// # Environment Variables
///
/// | Variable                    | Required | Default          | Description                        |
/// |-----------------------------|----------|------------------|------------------------------------|
/// | `CRISISLOG_DATA`            | Yes      | --               | Data directory (log, snapshots)    |
/// | `CRISISLOG_METRICS_LISTEN`  | No       | `127.0.0.1:9464` | Prometheus `/metrics` address      |
/// | `CRISISLOG_BROKER_CAPACITY` | No       | `4096`           | Live fan-out buffer per receiver   |
/// | `CRISISLOG_DEDUP_CAPACITY`  | No       | `65536`          | Client event ids kept for retries  |
/// | `CRISISLOG_REPLAY_BUDGET`   | No       | `500`            | Log positions read per replay tick |
#[derive(Debug, Clone, PartialEq)]
struct Config {
    data_dir: PathBuf,
    metrics_addr: SocketAddr,
    broker_capacity: usize,
    dedup_capacity: NonZeroUsize,
    replay_budget: usize,
}

const DEFAULT_METRICS_ADDR: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 9464);
const DEFAULT_REPLAY_BUDGET: usize = 500;

fn parse_positive(var: &str, default: usize) -> Result<usize, String> {
    match std::env::var(var) {
        Ok(val) => {
            let raw: usize = val
                .parse()
                .map_err(|e| format!("{var} is not a valid usize: {e}"))?;
            if raw == 0 {
                return Err(format!("{var} must be nonzero"));
            }
            Ok(raw)
        }
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Parse server configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` if `CRISISLOG_DATA` is unset, the metrics address does not
    /// parse, or a capacity is not a positive integer.
    fn from_env() -> Result<Config, String> {
        let data_dir = std::env::var("CRISISLOG_DATA")
            .map(PathBuf::from)
            .map_err(|_| "CRISISLOG_DATA environment variable is required".to_string())?;

        let metrics_addr = match std::env::var("CRISISLOG_METRICS_LISTEN") {
            Ok(val) => val.parse::<SocketAddr>().map_err(|e| {
                format!("CRISISLOG_METRICS_LISTEN is not a valid socket address: {e}")
            })?,
            Err(_) => DEFAULT_METRICS_ADDR,
        };

        let broker_capacity =
            parse_positive("CRISISLOG_BROKER_CAPACITY", crisislog::DEFAULT_BROKER_CAPACITY)?;
        let dedup_capacity =
            parse_positive("CRISISLOG_DEDUP_CAPACITY", crisislog::DEFAULT_DEDUP_CAPACITY)?;
        let replay_budget = parse_positive("CRISISLOG_REPLAY_BUDGET", DEFAULT_REPLAY_BUDGET)?;

        Ok(Config {
            data_dir,
            metrics_addr,
            broker_capacity,
            dedup_capacity: NonZeroUsize::new(dedup_capacity)
                .ok_or_else(|| "CRISISLOG_DEDUP_CAPACITY must be nonzero".to_string())?,
            replay_budget,
        })
    }

    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            broker_capacity: self.broker_capacity,
            dedup_capacity: self.dedup_capacity,
            replay: ReplaySettings {
                read_budget: self.replay_budget,
                ..ReplaySettings::default()
            },
            ..StoreConfig::default()
        }
    }
}

/// Initialize the global `tracing` subscriber, filtered by `RUST_LOG` (default `info`).
///
/// Repeated calls are a silent no-op.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Waits for SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Log every status change until the feed closes.
async fn log_status_changes(mut rx: broadcast::Receiver<crisislog::StatusChange>) {
    loop {
        match rx.recv().await {
            Ok(change) => match &change.reason {
                Some(reason) => tracing::warn!(
                    kind = ?change.kind,
                    id = %change.id,
                    from = change.from,
                    to = change.to,
                    reason = %reason,
                    "status change"
                ),
                None => tracing::info!(
                    kind = ?change.kind,
                    id = %change.id,
                    from = change.from,
                    to = change.to,
                    "status change"
                ),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "status feed lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };
    tracing::info!(
        data_dir = %config.data_dir.display(),
        metrics_addr = %config.metrics_addr,
        broker_capacity = config.broker_capacity,
        dedup_capacity = %config.dedup_capacity,
        replay_budget = config.replay_budget,
        "configuration loaded"
    );

    let metrics = match crisislog::metrics::install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to install metrics recorder");
            std::process::exit(1);
        }
    };

    let storage = match FileStorage::open(&config.data_dir) {
        Ok(storage) => storage,
        Err(e) => {
            tracing::error!(error = %e, "failed to open data directory");
            std::process::exit(1);
        }
    };

    let store = match EventStore::open(storage, config.store_config(), Arc::new(LogDispatcher)) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "failed to open event store");
            std::process::exit(1);
        }
    };

    let metrics_task = crisislog::metrics::serve_metrics(metrics, config.metrics_addr);
    let status_task = tokio::spawn(log_status_changes(store.status_changes()));

    shutdown_signal().await;
    tracing::info!("shutting down");

    store.shutdown().await;
    metrics_task.abort();
    status_task.abort();
}
