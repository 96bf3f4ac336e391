//! Tracing and metrics setup for the node service.
//!
//! Installs an `EnvFilter`-driven fmt subscriber (default `info`) and a
//! Prometheus recorder, and serves `/metrics`, `/live` and `/ready` with `axum`.
//! In tests the recorder handle is cached so repeated initialization is safe.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
#[cfg(test)]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the tracing subscriber and the Prometheus recorder.
pub fn init_observability(service_name: &str) -> Result<PrometheusHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    init_subscriber(tracing_subscriber::registry().with(filter).with(fmt_layer));
    let handle = install_metrics_recorder()?;
    tracing::debug!(service = service_name, "observability initialized");
    Ok(handle)
}

/// Serve Prometheus metrics and health probes on `addr`.
pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_metrics_on(handle, listener).await
}

pub(crate) async fn serve_metrics_on(
    handle: PrometheusHandle,
    listener: tokio::net::TcpListener,
) -> std::io::Result<()> {
    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route("/ready", axum::routing::get(|| async { "ok" }));
    axum::serve(listener, app.into_make_service()).await
}

fn install_metrics_recorder() -> Result<PrometheusHandle> {
    #[cfg(test)]
    {
        if let Some(handle) = METRICS_HANDLE.get() {
            return Ok(handle.clone());
        }
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("install metrics recorder")?;
        let _ = METRICS_HANDLE.set(handle.clone());
        Ok(handle)
    }
    #[cfg(not(test))]
    {
        PrometheusBuilder::new()
            .install_recorder()
            .context("install metrics recorder")
    }
}

// `try_init` in tests: several tests initialize in one process.
fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    #[cfg(test)]
    {
        let _ = subscriber.try_init();
    }
    #[cfg(not(test))]
    {
        subscriber.init();
    }
}
