pub mod player;
pub mod proxy_selector;

pub use player::{
    DynPlaybackEngine, MockPlaybackEngine, PlaybackEngine, PlaybackRequest, PlayerEvent,
    PlayerOrchestrator, PlayerStatus,
};
pub use proxy_selector::{
    DEFAULT_COOLDOWN, ProxyCandidate, ProxySelector, RankedCandidate, now_epoch_ms,
};
