use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;

use tracing::{info, warn};

use relay::{AppConfig, EdgeApplicationServer, Logger, RedisDatabase};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = Arc::new(AppConfig::parse());

    // guards have to outlive the server or buffered logs and sentry events get dropped
    let _guards = Logger::init(config.cargo_env, &config.log_dir, config.sentry_dsn.clone());

    info!("logger and env prepped...");

    // redis is optional, a configured one that won't connect is still fatal though
    let redis_db = match config.redis_url.as_deref().filter(|u| !u.is_empty()) {
        Some(redis_url) => {
            info!("connecting to redis...");
            let redis_db = RedisDatabase::connect(redis_url, config.redis_namespace.as_deref())
                .await
                .context("redis is configured but unreachable")?;
            Some(redis_db)
        }
        None => {
            warn!("REDIS_URL not set, proxy health is per-process");
            None
        }
    };

    EdgeApplicationServer::serve(config, redis_db)
        .await
        .context("relay server failed to start")?;

    Ok(())
}
