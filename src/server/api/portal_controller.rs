use axum::{
    Extension, Json, Router,
    extract::Query,
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::{debug, info};

use crate::{
    portal::{ChannelListing, DynPortalClient, StreamFormat},
    server::{
        dtos::portal_dto::{PortalAction, PortalQuery, StreamResponse},
        error::{AppResult, Error},
        services::edge_services::EdgeServices,
    },
};

/// one read-only facade over whichever portal is configured
pub struct PortalController;

impl PortalController {
    pub fn app() -> Router {
        Router::new().route("/", get(Self::portal_get))
    }

    async fn portal_get(
        Extension(services): Extension<EdgeServices>,
        Query(params): Query<PortalQuery>,
    ) -> AppResult<Response> {
        let action = PortalAction::parse(params.action.as_deref()).ok_or_else(|| {
            Error::BadRequest(format!(
                "Unknown action {:?}, expected channels or stream",
                params.action.as_deref().unwrap_or_default()
            ))
        })?;

        let portal = Self::portal(&services)?;

        match action {
            PortalAction::Channels => {
                let listing = Self::channels_with_drm(&services, &portal).await?;
                Ok(Json(listing).into_response())
            }
            PortalAction::Stream => {
                let cmd = params
                    .cmd
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| Error::BadRequest("Missing cmd parameter".to_string()))?;

                let url = portal.resolve_stream(cmd).await?;
                debug!("resolved {} -> {}", cmd, url);
                let manifest_kind = StreamFormat::from_url(&url, StreamFormat::Hls);

                Ok(Json(StreamResponse { url, manifest_kind }).into_response())
            }
        }
    }

    fn portal(services: &EdgeServices) -> AppResult<DynPortalClient> {
        services
            .portal
            .clone()
            .ok_or_else(|| Error::NotFound("No portal configured".to_string()))
    }

    // drm lives next to the portal data, not in it
    async fn channels_with_drm(
        services: &EdgeServices,
        portal: &DynPortalClient,
    ) -> AppResult<ChannelListing> {
        let mut listing = portal.list_channels().await?;

        let ids: Vec<String> = listing
            .channels
            .iter()
            .filter(|c| c.drm.is_none())
            .map(|c| c.id.clone())
            .collect();
        let mut drm = services.drm.get_many(&ids).await;

        for channel in listing.channels.iter_mut() {
            if let Some(config) = drm.remove(&channel.id) {
                channel.drm = Some(config);
            }
        }

        info!(
            "{} portal listed {} channels in {} genres",
            services.portal_name.unwrap_or("unknown"),
            listing.channels.len(),
            listing.genres.len()
        );
        Ok(listing)
    }
}
