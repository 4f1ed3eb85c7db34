//! Prometheus export of the `crisislog_*` metrics.
//!
//! The store records counters, gauges and the append latency histogram through the
//! `metrics` facade. This module installs the process-wide Prometheus recorder and serves
//! its rendering on `GET /metrics`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::task::JoinHandle;

/// Content type of the Prometheus text exposition format.
const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Error type for metrics installation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The global metrics recorder has already been installed.
    #[error("metrics recorder already installed")]
    AlreadyInstalled,

    /// The exporter refused to build or register its recorder.
    #[error("failed to install metrics recorder: {0}")]
    Install(String),
}

/// Cloneable handle on the installed Prometheus recorder.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    inner: Arc<PrometheusHandle>,
}

impl MetricsHandle {
    /// Render every registered metric in Prometheus exposition format.
    pub fn render(&self) -> String {
        self.inner.render()
    }
}

static RECORDER_HANDLE: OnceLock<MetricsHandle> = OnceLock::new();
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Install the global Prometheus metrics recorder.
///
/// Call once at startup before the store is opened, so the recovery gauges land in the
/// recorder. Metrics recorded before installation are discarded by the facade.
///
/// # Errors
///
/// Returns [`MetricsError::AlreadyInstalled`] on a second call in the same process, and
/// [`MetricsError::Install`] if another recorder was registered outside this module.
pub fn install_recorder() -> Result<MetricsHandle, MetricsError> {
    let _guard = INSTALL_LOCK.lock().expect("metrics install Mutex poisoned");
    if RECORDER_HANDLE.get().is_some() {
        return Err(MetricsError::AlreadyInstalled);
    }

    let prom_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::Install(e.to_string()))?;
    let handle = MetricsHandle {
        inner: Arc::new(prom_handle),
    };
    RECORDER_HANDLE
        .set(handle.clone())
        .map_err(|_| MetricsError::AlreadyInstalled)?;
    tracing::debug!("prometheus recorder installed");
    Ok(handle)
}

/// The recorder installed by an earlier [`install_recorder`] call, if any.
///
/// Tests sharing a process use this after losing the install race.
pub fn get_installed_handle() -> Option<MetricsHandle> {
    RECORDER_HANDLE.get().cloned()
}

fn metrics_router(handle: MetricsHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move {
                (
                    [(axum::http::header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)],
                    h.render(),
                )
            }
        }),
    )
}

/// Bind `addr` and serve `GET /metrics` on a spawned task.
///
/// A bind failure is logged and the returned task completes immediately; the store
/// keeps running without an exporter.
pub fn serve_metrics(handle: MetricsHandle, addr: SocketAddr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "failed to bind metrics listener");
                return;
            }
        };
        run_server(handle, listener).await;
    })
}

/// Serve `GET /metrics` on an already-bound listener.
///
/// Lets a caller bind port 0 and learn the address before the server starts.
pub fn serve_metrics_on_listener(
    handle: MetricsHandle,
    listener: tokio::net::TcpListener,
) -> JoinHandle<()> {
    tokio::spawn(run_server(handle, listener))
}

async fn run_server(handle: MetricsHandle, listener: tokio::net::TcpListener) {
    match listener.local_addr() {
        Ok(addr) => tracing::info!(addr = %addr, "metrics server listening"),
        Err(e) => tracing::warn!(error = %e, "metrics listener has no local address"),
    }
    if let Err(e) = axum::serve(listener, metrics_router(handle)).await {
        tracing::error!(error = %e, "metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn handle() -> MetricsHandle {
        install_recorder()
            .ok()
            .or_else(get_installed_handle)
            .expect("recorder should be installed")
    }

    #[test]
    fn second_install_is_rejected() {
        let _ = handle();
        let err = install_recorder().expect_err("second install must fail");
        assert!(
            matches!(err, MetricsError::AlreadyInstalled),
            "error should be AlreadyInstalled, got: {err:?}"
        );
        assert!(get_installed_handle().is_some());
    }

    #[test]
    fn render_includes_recorded_counter() {
        let handle = handle();
        metrics::counter!("crisislog_metrics_selftest_total").increment(3);
        let body = handle.render();
        assert!(
            body.contains("crisislog_metrics_selftest_total"),
            "rendered body should contain the counter:\n{body}"
        );
    }

    #[tokio::test]
    async fn serve_metrics_stays_running() {
        let join = serve_metrics(handle(), "127.0.0.1:0".parse().expect("addr"));
        let waited = tokio::time::timeout(Duration::from_millis(20), join).await;
        assert!(waited.is_err(), "metrics server should still be running");
    }

    #[tokio::test]
    async fn serve_metrics_on_listener_stays_running() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let addr = listener.local_addr().expect("local addr");
        assert_ne!(addr.port(), 0);

        let join = serve_metrics_on_listener(handle(), listener);
        let waited = tokio::time::timeout(Duration::from_millis(20), join).await;
        assert!(waited.is_err(), "metrics server should still be running");
    }
}
