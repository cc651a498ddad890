use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::{database::RedisDatabase, portal::DrmConfig};

pub type DynChannelDrmRepository = Arc<dyn ChannelDrmRepository + Send + Sync>;

/// drm config per channel id, written by the catalog side. read-only from here
#[async_trait]
pub trait ChannelDrmRepository {
    async fn get_drm(&self, channel_id: &str) -> Option<DrmConfig>;

    async fn get_many(&self, channel_ids: &[String]) -> HashMap<String, DrmConfig>;
}

#[derive(Default)]
pub struct InMemoryChannelDrmRepository {
    records: RwLock<HashMap<String, DrmConfig>>,
}

impl InMemoryChannelDrmRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// seeding for tests and local runs
    pub fn with_record(self, channel_id: &str, drm: DrmConfig) -> Self {
        if let Ok(mut records) = self.records.write() {
            records.insert(channel_id.to_string(), drm);
        }
        self
    }
}

#[async_trait]
impl ChannelDrmRepository for InMemoryChannelDrmRepository {
    async fn get_drm(&self, channel_id: &str) -> Option<DrmConfig> {
        self.records.read().ok()?.get(channel_id).cloned()
    }

    async fn get_many(&self, channel_ids: &[String]) -> HashMap<String, DrmConfig> {
        let Ok(records) = self.records.read() else {
            return HashMap::new();
        };
        channel_ids
            .iter()
            .filter_map(|id| records.get(id).map(|drm| (id.clone(), drm.clone())))
            .collect()
    }
}

pub struct RedisChannelDrmRepository {
    redis: Arc<RedisDatabase>,
}

impl RedisChannelDrmRepository {
    pub fn new(redis: Arc<RedisDatabase>) -> Self {
        Self { redis }
    }

    fn key(&self, channel_id: &str) -> String {
        self.redis.key("channel_drm", channel_id)
    }

    fn parse(channel_id: &str, raw: &str) -> Option<DrmConfig> {
        serde_json::from_str(raw)
            .map_err(|e| warn!("ignoring malformed drm record for {}: {}", channel_id, e))
            .ok()
    }
}

#[async_trait]
impl ChannelDrmRepository for RedisChannelDrmRepository {
    async fn get_drm(&self, channel_id: &str) -> Option<DrmConfig> {
        let mut conn = self.redis.connection.clone();
        let result: Result<Option<String>, redis::RedisError> = redis::cmd("GET")
            .arg(self.key(channel_id))
            .query_async(&mut conn)
            .await;

        match result {
            Ok(raw) => raw.and_then(|raw| Self::parse(channel_id, &raw)),
            Err(e) => {
                error!("failed to read drm for {}: {}", channel_id, e);
                None
            }
        }
    }

    async fn get_many(&self, channel_ids: &[String]) -> HashMap<String, DrmConfig> {
        if channel_ids.is_empty() {
            return HashMap::new();
        }

        // one round trip for the whole listing
        let mut pipe = redis::pipe();
        for id in channel_ids {
            pipe.get(self.key(id));
        }

        let mut conn = self.redis.connection.clone();
        let result: Result<Vec<Option<String>>, redis::RedisError> =
            pipe.query_async(&mut conn).await;

        match result {
            Ok(values) => {
                let found: HashMap<String, DrmConfig> = channel_ids
                    .iter()
                    .zip(values)
                    .filter_map(|(id, raw)| {
                        raw.and_then(|raw| Self::parse(id, &raw))
                            .map(|drm| (id.clone(), drm))
                    })
                    .collect();
                debug!("found drm records for {} channels", found.len());
                found
            }
            Err(e) => {
                error!("drm pipeline failed: {}", e);
                HashMap::new()
            }
        }
    }
}
