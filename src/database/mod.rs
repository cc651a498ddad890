pub mod channel_drm_repository;
pub mod proxy_health_repository;
pub mod redis_connection;

pub use channel_drm_repository::{
    ChannelDrmRepository, DynChannelDrmRepository, InMemoryChannelDrmRepository,
    RedisChannelDrmRepository,
};
pub use proxy_health_repository::{
    DynProxyHealthStore, InMemoryProxyHealthStore, ProxyHealthRecord, ProxyHealthStore,
    RedisProxyHealthStore, proxy_key,
};
pub use redis_connection::{RedisDatabase, namespaced_key};
