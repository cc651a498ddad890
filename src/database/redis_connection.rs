use std::time::Instant;

use anyhow::Context;
use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd};
use tracing::info;

/// shared store for proxy health records and per-channel drm config. several relays can share
/// one redis, `namespace` keeps their records apart
#[derive(Debug, Clone)]
pub struct RedisDatabase {
    pub connection: MultiplexedConnection,
    namespace: Option<String>,
}

impl RedisDatabase {
    pub async fn connect(redis_url: &str, namespace: Option<&str>) -> anyhow::Result<Self> {
        let client = Client::open(redis_url).context("Failed to create Redis client")?;

        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .context("Failed to connect to Redis database")?;

        let namespace = namespace
            .map(|ns| ns.trim().trim_end_matches(':').to_string())
            .filter(|ns| !ns.is_empty());

        info!(
            "Redis connection established (namespace: {})",
            namespace.as_deref().unwrap_or("none")
        );

        Ok(Self {
            connection,
            namespace,
        })
    }

    /// `<kind>:<id>`, prefixed with the namespace when there is one
    pub fn key(&self, kind: &str, id: &str) -> String {
        namespaced_key(self.namespace.as_deref(), kind, id)
    }

    /// PING round trip in milliseconds
    pub async fn ping_ms(&self) -> anyhow::Result<f64> {
        let started = Instant::now();

        let mut conn = self.connection.clone();
        let pong: String = Cmd::new()
            .arg("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING failed")?;
        anyhow::ensure!(pong == "PONG", "unexpected PING reply {}", pong);

        Ok(started.elapsed().as_secs_f64() * 1000.0)
    }
}

pub fn namespaced_key(namespace: Option<&str>, kind: &str, id: &str) -> String {
    match namespace {
        Some(ns) => format!("{}:{}:{}", ns, kind, id),
        None => format!("{}:{}", kind, id),
    }
}
