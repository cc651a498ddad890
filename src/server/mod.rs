pub mod api;
pub mod dtos;
pub mod error;
pub mod services;

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use anyhow::Context;
use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{net::TcpListener, signal};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

use crate::{config::AppConfig, database::RedisDatabase};
use api::{
    PortalController, ProxiesController, ProxyController,
    health_controller::{health_endpoint, metrics_endpoint},
};
pub use services::EdgeServices;

static STARTED_AT: LazyLock<Instant> = LazyLock::new(Instant::now);

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn get_uptime_seconds() -> u64 {
    STARTED_AT.elapsed().as_secs()
}

pub struct EdgeApplicationServer;

impl EdgeApplicationServer {
    pub async fn serve(config: Arc<AppConfig>, redis_db: Option<RedisDatabase>) -> anyhow::Result<()> {
        // touch it so uptime counts from boot, not from the first health check
        LazyLock::force(&STARTED_AT);

        let metrics = PrometheusBuilder::new()
            .install_recorder()
            .context("could not install prometheus recorder")?;

        let services = EdgeServices::new(config.clone(), redis_db)
            .context("could not build services")?
            .with_metrics(metrics);

        let router = Self::router(services);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding to {}", addr))?;

        info!("relay listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("running relay server")?;

        Ok(())
    }

    /// every route, split out from `serve` so tests can drive it with `oneshot`
    pub fn router(services: EdgeServices) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .nest("/proxy", ProxyController::app())
            .nest("/portal", PortalController::app())
            .nest("/proxies", ProxiesController::app())
            .route("/health", get(health_endpoint))
            .route("/metrics", get(metrics_endpoint))
            // older players were handed bare `/?url=` links
            .merge(ProxyController::app())
            .layer(Extension(services))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("failed to install ctrl-c handler: {}", e);
    }
    info!("shutting down");
}
