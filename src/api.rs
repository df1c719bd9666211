//! Ops HTTP surface.
//!
//! `/health` for liveness probes and `/metrics` in Prometheus exposition
//! format. Runs beside the bot; it is never on the delivery path and its
//! failure does not affect digests.

use std::net::SocketAddr;

use anyhow::Context;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_http::cors::CorsLayer;
use tracing::info;

pub struct OpsServer {
    handle: PrometheusHandle,
}

impl OpsServer {
    /// Install the Prometheus recorder. Must run before any metric is
    /// emitted; call once at startup.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("installing prometheus recorder")?;
        Ok(OpsServer { handle })
    }

    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/metrics",
                get(move || {
                    let h = handle.clone();
                    async move { h.render() }
                }),
            )
            .layer(CorsLayer::very_permissive())
    }

    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding ops listener on {addr}"))?;
        info!(%addr, "ops surface listening");
        axum::serve(listener, self.router())
            .await
            .context("ops server")
    }
}
