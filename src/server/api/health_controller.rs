use axum::Extension;
use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::error;

use crate::logger::Logger;
use crate::server::dtos::health_dto::{
    HealthResponse, HealthStatus, RedisHealth, ServiceHealthDetails,
};
use crate::server::services::edge_services::EdgeServices;
use crate::server::{get_app_version, get_uptime_seconds};

/// only redis can make this unhealthy, portals and proxies are checked on use
pub async fn health_endpoint(
    Extension(services): Extension<EdgeServices>,
) -> (StatusCode, Json<HealthResponse>) {
    let redis_health = check_redis_health(&services).await;

    let overall_status = match &redis_health {
        Some(redis) if redis.status == HealthStatus::Unhealthy => HealthStatus::Unhealthy,
        _ => HealthStatus::Healthy,
    };

    let response = HealthResponse {
        status: overall_status,
        timestamp: Utc::now(),
        uptime_seconds: get_uptime_seconds(),
        version: get_app_version().to_string(),
        environment: Logger::environment_name(services.config.cargo_env).to_string(),
        services: ServiceHealthDetails {
            redis: redis_health,
            portal: services.portal_name,
            proxy_candidates: services.selector.candidates().len(),
        },
    };

    let http_status = match overall_status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(response))
}

/// prometheus text format, 404 when no recorder is installed
pub async fn metrics_endpoint(Extension(services): Extension<EdgeServices>) -> Response {
    match &services.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// None when running without redis, that's not a failure
async fn check_redis_health(services: &EdgeServices) -> Option<RedisHealth> {
    let redis = services.redis.as_ref()?;

    let (status, response_time_ms) = redis
        .ping_ms()
        .await
        .map(|elapsed| (HealthStatus::Healthy, elapsed))
        .unwrap_or_else(|e| {
            error!("Redis health check failed: {:#}", e);
            (HealthStatus::Unhealthy, 0.0)
        });

    Some(RedisHealth {
        status,
        response_time_ms,
    })
}
