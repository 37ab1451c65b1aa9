// src/metrics.rs
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::sync::watch;

use crate::scheduler::wait_for_shutdown;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Call at most once per process.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("installing prometheus recorder")?;
        crate::scheduler::ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }

    /// Serve `/metrics` on `addr` until shutdown is signalled.
    pub async fn serve(self, addr: SocketAddr, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding metrics listener on {addr}"))?;
        tracing::info!(%addr, "metrics endpoint listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
            .await
            .context("metrics server")
    }
}
