use std::sync::Arc;

use async_trait::async_trait;
use mockall::automock;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::proxy_selector::{ProxyCandidate, ProxySelector};
use crate::{
    database::DynChannelDrmRepository,
    manifest::ProxyUrlBuilder,
    portal::{Channel, DrmConfig, DynPortalClient, StreamFormat},
    server::error::AppResult,
};

/// what the external player gets told to load
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackRequest {
    /// proxied link, or the upstream url itself when the channel skips the proxy
    pub manifest_url: String,
    pub upstream_url: String,
    pub format: StreamFormat,
    pub drm: Option<DrmConfig>,
    pub proxy: Option<ProxyCandidate>,
}

pub type DynPlaybackEngine = Arc<dyn PlaybackEngine + Send + Sync>;

#[automock]
#[async_trait]
pub trait PlaybackEngine {
    async fn load(&self, request: PlaybackRequest) -> AppResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    Fatal(String),
    // buffering hiccups and the like, the player deals with those itself
    Recoverable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerStatus {
    Idle,
    Active { label: String },
    Offline,
}

struct PlaybackSession {
    channel: Channel,
    upstream_url: String,
    drm: Option<DrmConfig>,
    order: Vec<ProxyCandidate>,
    index: usize,
}

impl PlaybackSession {
    fn current(&self) -> Option<&ProxyCandidate> {
        self.order.get(self.index)
    }

    fn request_through(&self, candidate: Option<&ProxyCandidate>) -> PlaybackRequest {
        let manifest_url = match candidate {
            Some(candidate) => ProxyUrlBuilder::new(&candidate.base_url)
                .with_param("ua", self.channel.user_agent.as_deref())
                .with_param("referer", self.channel.referrer.as_deref())
                .build(&self.upstream_url),
            None => self.upstream_url.clone(),
        };

        PlaybackRequest {
            manifest_url,
            upstream_url: self.upstream_url.clone(),
            format: self.channel.manifest_kind,
            drm: self.drm.clone(),
            proxy: candidate.cloned(),
        }
    }
}

/// wires a channel into the player through the best proxy and walks down the list on fatal
/// errors. no backoff, no second lap: once the list is spent the channel is offline
pub struct PlayerOrchestrator {
    portal: DynPortalClient,
    selector: Arc<ProxySelector>,
    engine: DynPlaybackEngine,
    drm_repository: Option<DynChannelDrmRepository>,
    status: watch::Sender<PlayerStatus>,
    session: Option<PlaybackSession>,
}

impl PlayerOrchestrator {
    pub fn new(
        portal: DynPortalClient,
        selector: Arc<ProxySelector>,
        engine: DynPlaybackEngine,
    ) -> Self {
        let (status, _) = watch::channel(PlayerStatus::Idle);
        Self {
            portal,
            selector,
            engine,
            drm_repository: None,
            status,
            session: None,
        }
    }

    pub fn with_drm_repository(mut self, repository: DynChannelDrmRepository) -> Self {
        self.drm_repository = Some(repository);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> PlayerStatus {
        self.status.borrow().clone()
    }

    pub fn active_proxy(&self) -> Option<&ProxyCandidate> {
        self.session.as_ref().and_then(|s| s.current())
    }

    /// resolves the channel fresh (stalker links can be single-use) and starts on the best proxy
    pub async fn play(&mut self, channel: Channel) -> AppResult<()> {
        // whatever was playing is gone, a failed resolve must not leave it failing over
        self.stop();

        let upstream_url = self.portal.resolve_stream(&channel.upstream_command).await?;

        let drm = match (&channel.drm, &self.drm_repository) {
            (Some(drm), _) => Some(drm.clone()),
            (None, Some(repository)) => repository.get_drm(&channel.id).await,
            (None, None) => None,
        };

        let order = if channel.use_proxy {
            self.selector.pick_order().await
        } else {
            Vec::new()
        };

        info!(
            "playing {} with {} proxy candidates",
            channel.name,
            order.len()
        );

        self.session = Some(PlaybackSession {
            channel,
            upstream_url,
            drm,
            order,
            index: 0,
        });

        self.start_current().await;
        Ok(())
    }

    pub async fn handle_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::Fatal(reason) => {
                warn!("fatal playback error: {}", reason);
                self.on_fatal_playback_error().await;
            }
            PlayerEvent::Recoverable(reason) => debug!("ignoring recoverable player error: {}", reason),
        }
    }

    /// marks the current proxy as failed and reloads the same manifest through the next one
    pub async fn on_fatal_playback_error(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if let Some(failed) = session.current() {
            self.selector.record_failure(failed).await;
        }
        session.index += 1;

        self.start_current().await;
    }

    /// abort on unmount
    pub fn stop(&mut self) {
        self.session = None;
        self.status.send_replace(PlayerStatus::Idle);
    }

    // tries the candidate at the session index, moving on while loads fail outright
    async fn start_current(&mut self) {
        loop {
            let Some(session) = self.session.as_mut() else {
                return;
            };

            let direct = session.order.is_empty() && session.index == 0;
            let candidate = session.current().cloned();

            if candidate.is_none() && !direct {
                error!("no proxy left for {}, going offline", session.channel.name);
                self.status.send_replace(PlayerStatus::Offline);
                return;
            }

            let request = session.request_through(candidate.as_ref());
            let label = candidate
                .as_ref()
                .map(|c| c.label.clone())
                .unwrap_or_else(|| "direct".to_string());

            match self.engine.load(request).await {
                Ok(()) => {
                    info!("playing through {}", label);
                    self.status.send_replace(PlayerStatus::Active { label });
                    return;
                }
                Err(e) => {
                    warn!("load through {} failed: {}", label, e);
                    match candidate {
                        Some(failed) => {
                            self.selector.record_failure(&failed).await;
                            session.index += 1;
                        }
                        None => {
                            self.status.send_replace(PlayerStatus::Offline);
                            return;
                        }
                    }
                }
            }
        }
    }
}
