use axum::{Extension, Json, Router, routing::get, routing::post};
use tracing::warn;

use crate::{
    client::now_epoch_ms,
    server::{
        dtos::proxy_dto::{ProxyFailureRequest, ProxyFailureResponse, ProxyListResponse},
        error::{AppResult, Error},
        services::edge_services::EdgeServices,
    },
};

/// proxy ordering for players that do their own failover
pub struct ProxiesController;

impl ProxiesController {
    pub fn app() -> Router {
        Router::new()
            .route("/", get(Self::list))
            .route("/failures", post(Self::record_failure))
    }

    async fn list(Extension(services): Extension<EdgeServices>) -> Json<ProxyListResponse> {
        let proxies = services.selector.ranked_at(now_epoch_ms()).await;
        Json(ProxyListResponse { proxies })
    }

    async fn record_failure(
        Extension(services): Extension<EdgeServices>,
        Json(request): Json<ProxyFailureRequest>,
    ) -> AppResult<Json<ProxyFailureResponse>> {
        let Some(candidate) = services.selector.find(&request.base_url).cloned() else {
            warn!("failure reported for unknown proxy {}", request.base_url);
            return Err(Error::NotFound(format!(
                "{} is not a configured proxy",
                request.base_url
            )));
        };

        let now = now_epoch_ms();
        services.selector.record_failure_at(&candidate, now).await;

        Ok(Json(ProxyFailureResponse {
            base_url: candidate.base_url,
            label: candidate.label,
            failed_at_epoch_ms: now,
        }))
    }
}
