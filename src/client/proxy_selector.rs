use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::database::{DynProxyHealthStore, ProxyHealthRecord, proxy_key};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCandidate {
    pub base_url: String,
    pub label: String,
}

impl ProxyCandidate {
    pub fn new(label: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            label: label.into(),
        }
    }

    pub fn key(&self) -> String {
        proxy_key(&self.base_url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedCandidate {
    #[serde(flatten)]
    pub candidate: ProxyCandidate,
    pub cooling_down: bool,
}

pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// orders the configured proxies so recently failed ones go last. they are never dropped, a
/// cooling down proxy still beats having nothing to try
pub struct ProxySelector {
    candidates: Vec<ProxyCandidate>,
    store: DynProxyHealthStore,
    cooldown: Duration,
}

impl ProxySelector {
    pub fn new(candidates: Vec<ProxyCandidate>, store: DynProxyHealthStore, cooldown: Duration) -> Self {
        Self {
            candidates,
            store,
            cooldown,
        }
    }

    pub fn candidates(&self) -> &[ProxyCandidate] {
        &self.candidates
    }

    pub fn find(&self, base_url: &str) -> Option<&ProxyCandidate> {
        let key = proxy_key(base_url);
        self.candidates.iter().find(|c| c.key() == key)
    }

    pub async fn pick_order(&self) -> Vec<ProxyCandidate> {
        self.pick_order_at(now_epoch_ms()).await
    }

    pub async fn pick_order_at(&self, now_epoch_ms: i64) -> Vec<ProxyCandidate> {
        self.ranked_at(now_epoch_ms)
            .await
            .into_iter()
            .map(|ranked| ranked.candidate)
            .collect()
    }

    /// available first, cooling down after, configured order kept inside each group
    pub async fn ranked_at(&self, now_epoch_ms: i64) -> Vec<RankedCandidate> {
        let mut available = Vec::with_capacity(self.candidates.len());
        let mut cooling = Vec::new();

        for candidate in &self.candidates {
            let fresh = self
                .store
                .get_fresh(&candidate.key(), now_epoch_ms, self.cooldown)
                .await;

            match fresh {
                Some(record) => {
                    debug!(
                        "{} cooling down, failed {}ms ago",
                        candidate.label,
                        now_epoch_ms - record.failed_at_epoch_ms
                    );
                    cooling.push(RankedCandidate {
                        candidate: candidate.clone(),
                        cooling_down: true,
                    });
                }
                None => available.push(RankedCandidate {
                    candidate: candidate.clone(),
                    cooling_down: false,
                }),
            }
        }

        available.extend(cooling);
        available
    }

    pub async fn record_failure(&self, candidate: &ProxyCandidate) {
        self.record_failure_at(candidate, now_epoch_ms()).await
    }

    pub async fn record_failure_at(&self, candidate: &ProxyCandidate, now_epoch_ms: i64) {
        info!("marking proxy {} ({}) as failed", candidate.label, candidate.base_url);
        metrics::counter!("relay_proxy_failures_total", "label" => candidate.label.clone())
            .increment(1);
        self.store
            .set(
                &candidate.key(),
                ProxyHealthRecord {
                    failed_at_epoch_ms: now_epoch_ms,
                },
            )
            .await;
    }
}
