use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, error};

use crate::database::RedisDatabase;

/// last failure of one proxy candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHealthRecord {
    pub failed_at_epoch_ms: i64,
}

impl ProxyHealthRecord {
    /// a record exactly `cooldown` old already counts as gone
    pub fn is_expired(&self, now_epoch_ms: i64, cooldown: Duration) -> bool {
        now_epoch_ms.saturating_sub(self.failed_at_epoch_ms) >= cooldown.as_millis() as i64
    }
}

/// the key a candidate's record lives under, derived from its base url
pub fn proxy_key(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_ascii_lowercase()
}

pub type DynProxyHealthStore = Arc<dyn ProxyHealthStore + Send + Sync>;

/// failure memory for proxy candidates. last write wins, nobody sweeps expired entries,
/// readers go through `get_fresh` and drop them on the way
#[async_trait]
pub trait ProxyHealthStore {
    async fn get(&self, proxy_key: &str) -> Option<ProxyHealthRecord>;

    async fn set(&self, proxy_key: &str, record: ProxyHealthRecord);

    async fn clear(&self, proxy_key: &str);

    async fn get_fresh(
        &self,
        proxy_key: &str,
        now_epoch_ms: i64,
        cooldown: Duration,
    ) -> Option<ProxyHealthRecord> {
        let record = self.get(proxy_key).await?;
        if record.is_expired(now_epoch_ms, cooldown) {
            debug!("purging expired health record for {}", proxy_key);
            self.clear(proxy_key).await;
            return None;
        }
        Some(record)
    }
}

/// for tests and redis-less deployments
#[derive(Default)]
pub struct InMemoryProxyHealthStore {
    records: Mutex<HashMap<String, ProxyHealthRecord>>,
}

impl InMemoryProxyHealthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProxyHealthStore for InMemoryProxyHealthStore {
    async fn get(&self, proxy_key: &str) -> Option<ProxyHealthRecord> {
        match self.records.lock() {
            Ok(records) => records.get(proxy_key).copied(),
            Err(e) => {
                error!("proxy health map poisoned: {}", e);
                None
            }
        }
    }

    async fn set(&self, proxy_key: &str, record: ProxyHealthRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(proxy_key.to_string(), record);
        }
    }

    async fn clear(&self, proxy_key: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.remove(proxy_key);
        }
    }
}

pub struct RedisProxyHealthStore {
    redis: Arc<RedisDatabase>,
    cooldown: Duration,
}

impl RedisProxyHealthStore {
    pub fn new(redis: Arc<RedisDatabase>, cooldown: Duration) -> Self {
        Self { redis, cooldown }
    }

    fn key(&self, proxy_key: &str) -> String {
        self.redis.key("proxy_health", proxy_key)
    }
}

// redis errors are logged and read as "no record", a broken store shouldn't hide proxies
#[async_trait]
impl ProxyHealthStore for RedisProxyHealthStore {
    async fn get(&self, proxy_key: &str) -> Option<ProxyHealthRecord> {
        let mut conn = self.redis.connection.clone();
        let result: Result<Option<i64>, redis::RedisError> = conn.get(self.key(proxy_key)).await;

        match result {
            Ok(value) => value.map(|failed_at_epoch_ms| ProxyHealthRecord { failed_at_epoch_ms }),
            Err(e) => {
                error!("failed to read proxy health for {}: {}", proxy_key, e);
                None
            }
        }
    }

    async fn set(&self, proxy_key: &str, record: ProxyHealthRecord) {
        let mut conn = self.redis.connection.clone();
        // redis drops it on its own too, the lazy check still applies on read
        let ttl = self.cooldown.as_secs().max(1);
        let result: Result<(), redis::RedisError> = conn
            .set_ex(self.key(proxy_key), record.failed_at_epoch_ms, ttl)
            .await;

        match result {
            Ok(_) => debug!("recorded proxy failure for {} (TTL {}s)", proxy_key, ttl),
            Err(e) => error!("failed to record proxy failure for {}: {}", proxy_key, e),
        }
    }

    async fn clear(&self, proxy_key: &str) {
        let mut conn = self.redis.connection.clone();
        let result: Result<i32, redis::RedisError> = conn.del(self.key(proxy_key)).await;

        if let Err(e) = result {
            error!("failed to clear proxy health for {}: {}", proxy_key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_expiry_boundary() {
        let record = ProxyHealthRecord {
            failed_at_epoch_ms: 1_000,
        };

        assert!(!record.is_expired(1_000 + 3_599_999, HOUR));
        assert!(record.is_expired(1_000 + 3_600_000, HOUR));
    }

    #[tokio::test]
    async fn test_get_fresh_purges_expired() {
        let store = InMemoryProxyHealthStore::new();
        store
            .set("a", ProxyHealthRecord { failed_at_epoch_ms: 0 })
            .await;

        assert!(store.get_fresh("a", 3_600_000, HOUR).await.is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_proxy_key_normalizes() {
        assert_eq!(proxy_key(" https://P1.example/proxy/ "), "https://p1.example/proxy");
    }
}
