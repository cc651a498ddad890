use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct RedisHealth {
    pub status: HealthStatus,
    pub response_time_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct ServiceHealthDetails {
    // absent when the service runs without redis
    pub redis: Option<RedisHealth>,
    pub portal: Option<&'static str>,
    pub proxy_candidates: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub version: String,
    pub environment: String,
    pub services: ServiceHealthDetails,
}
