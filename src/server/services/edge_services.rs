use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;

use crate::{
    client::{ProxyCandidate, ProxySelector},
    config::AppConfig,
    database::{
        DynChannelDrmRepository, DynProxyHealthStore, InMemoryChannelDrmRepository,
        InMemoryProxyHealthStore, RedisChannelDrmRepository, RedisDatabase, RedisProxyHealthStore,
    },
    portal::{DynPortalClient, Portal},
    server::error::AppResult,
};

use super::origin_services::OriginFetcher;

/// everything the handlers need, cloned into each request through `Extension`
/// redis is optional here, without it health and drm records are process-local
#[derive(Clone)]
pub struct EdgeServices {
    pub config: Arc<AppConfig>,
    pub fetcher: OriginFetcher,
    pub portal: Option<DynPortalClient>,
    pub portal_name: Option<&'static str>,
    pub drm: DynChannelDrmRepository,
    pub proxy_health: DynProxyHealthStore,
    pub selector: Arc<ProxySelector>,
    pub redis: Option<Arc<RedisDatabase>>,
    pub metrics: Option<PrometheusHandle>,
}

impl EdgeServices {
    pub fn new(config: Arc<AppConfig>, redis_db: Option<RedisDatabase>) -> AppResult<Self> {
        info!("starting edge services...");

        let cooldown = Duration::from_secs(config.proxy_cooldown_secs);
        let redis = redis_db.map(Arc::new);

        let (proxy_health, drm) = match &redis {
            Some(redis) => (
                Arc::new(RedisProxyHealthStore::new(redis.clone(), cooldown)) as DynProxyHealthStore,
                Arc::new(RedisChannelDrmRepository::new(redis.clone())) as DynChannelDrmRepository,
            ),
            None => {
                info!("no redis configured, proxy health and drm records stay in memory");
                (
                    Arc::new(InMemoryProxyHealthStore::new()) as DynProxyHealthStore,
                    Arc::new(InMemoryChannelDrmRepository::new()) as DynChannelDrmRepository,
                )
            }
        };

        // the stream path gets no timeout, the portal does
        let fetcher = OriginFetcher::new();
        let portal_fetcher =
            OriginFetcher::with_timeout(Duration::from_secs(config.upstream_timeout_secs));

        let (portal, portal_name) = match Portal::from_config(&config, portal_fetcher)? {
            Some(portal) => {
                let name = portal.name();
                info!("{} portal configured", name);
                (Some(Arc::new(portal) as DynPortalClient), Some(name))
            }
            None => {
                info!("no portal configured, /portal will answer 404");
                (None, None)
            }
        };

        let candidates = config
            .proxy_candidates()
            .into_iter()
            .map(|(label, base)| ProxyCandidate::new(label, base))
            .collect::<Vec<_>>();
        info!("{} proxy candidates configured", candidates.len());

        let selector = Arc::new(ProxySelector::new(candidates, proxy_health.clone(), cooldown));

        Ok(Self {
            config,
            fetcher,
            portal,
            portal_name,
            drm,
            proxy_health,
            selector,
            redis,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// swaps the configured portal, mostly so tests can plug a mock in
    pub fn with_portal(mut self, portal: DynPortalClient, name: &'static str) -> Self {
        self.portal = Some(portal);
        self.portal_name = Some(name);
        self
    }

    pub fn with_drm_repository(mut self, drm: DynChannelDrmRepository) -> Self {
        self.drm = drm;
        self
    }
}
