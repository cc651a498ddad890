// both portal protocols end up as the same Channel/Genre shapes, everything past this module
// only ever sees those
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mockall::automock;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::{
    config::{AppConfig, PortalKind},
    manifest::ManifestKind,
    server::{
        error::{AppResult, Error},
        services::origin_services::OriginFetcher,
    },
};

pub mod stalker;
pub mod xtream;

pub use stalker::{StalkerAdapter, StalkerState, extract_stream_url};
pub use xtream::XtreamAdapter;

/// channels without a known genre/category land here
pub const DEFAULT_GENRE: &str = "General";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    Hls,
    Dash,
    Embed,
}

impl StreamFormat {
    /// only an explicit `.mpd`/`.m3u8` decides, anything else keeps `fallback`
    pub fn from_url(url: &str, fallback: Self) -> Self {
        match ManifestKind::detect(url, None) {
            Some(kind) => kind.into(),
            None => fallback,
        }
    }
}

impl From<ManifestKind> for StreamFormat {
    fn from(kind: ManifestKind) -> Self {
        match kind {
            ManifestKind::Hls => Self::Hls,
            ManifestKind::Dash => Self::Dash,
        }
    }
}

/// passed through to the player as-is, never generated here
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DrmConfig {
    ClearKey {
        clear_keys: HashMap<String, String>,
    },
    Widevine {
        widevine_license_url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub logo: Option<String>,
    /// stalker cmd or xtream stream id, stalker ones can be single-use so resolve per attempt
    pub upstream_command: String,
    pub manifest_kind: StreamFormat,
    pub genre: String,
    pub drm: Option<DrmConfig>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub use_proxy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genre {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelListing {
    pub channels: Vec<Channel>,
    pub genres: Vec<Genre>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalCredentials {
    Mac(String),
    Account { username: String, password: String },
}

/// stalker needs a token before anything else, xtream has none and passes credentials on every
/// call. sessions are never torn down explicitly, they get replaced when the portal rejects them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalSession {
    pub token: Option<String>,
    pub credentials: PortalCredentials,
    pub expires_implicitly: bool,
}

pub type DynPortalClient = Arc<dyn PortalClient + Send + Sync>;

#[automock]
#[async_trait]
pub trait PortalClient {
    async fn list_channels(&self) -> AppResult<ChannelListing>;

    /// turns a channel's upstream command into a playable url
    async fn resolve_stream(&self, command: &str) -> AppResult<String>;
}

pub enum Portal {
    Stalker(StalkerAdapter),
    Xtream(XtreamAdapter),
}

impl Portal {
    /// `None` when no portal is configured, the facade then answers 404
    pub fn from_config(config: &AppConfig, fetcher: OriginFetcher) -> AppResult<Option<Self>> {
        let Some(portal_url) = config.portal_url.as_deref().filter(|u| !u.trim().is_empty())
        else {
            return Ok(None);
        };

        let portal = match config.portal_kind {
            PortalKind::Stalker => {
                let mac = config.portal_mac.as_deref().ok_or_else(|| {
                    Error::InternalServerErrorWithContext(
                        "stalker portal configured without PORTAL_MAC".to_string(),
                    )
                })?;
                Self::Stalker(StalkerAdapter::new(portal_url, mac, fetcher))
            }
            PortalKind::Xtream => {
                let (Some(username), Some(password)) = (
                    config.portal_username.as_deref(),
                    config.portal_password.as_deref(),
                ) else {
                    return Err(Error::InternalServerErrorWithContext(
                        "xtream portal configured without PORTAL_USERNAME/PORTAL_PASSWORD"
                            .to_string(),
                    ));
                };
                Self::Xtream(XtreamAdapter::new(portal_url, username, password, fetcher))
            }
        };

        Ok(Some(portal))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Stalker(_) => "stalker",
            Self::Xtream(_) => "xtream",
        }
    }
}

#[async_trait]
impl PortalClient for Portal {
    async fn list_channels(&self) -> AppResult<ChannelListing> {
        match self {
            Self::Stalker(adapter) => adapter.list_channels().await,
            Self::Xtream(adapter) => adapter.list_channels().await,
        }
    }

    async fn resolve_stream(&self, command: &str) -> AppResult<String> {
        match self {
            Self::Stalker(adapter) => adapter.resolve_stream(command).await,
            Self::Xtream(adapter) => adapter.resolve_stream(command).await,
        }
    }
}

/// GET + status check + body as text. non-2xx comes back as `UpstreamRejected`
pub(crate) async fn fetch_text(
    fetcher: &OriginFetcher,
    url: &str,
    headers: &HeaderMap,
    portal: &'static str,
    action: &str,
) -> AppResult<String> {
    metrics::counter!("relay_portal_calls_total", "portal" => portal, "action" => action.to_string())
        .increment(1);

    let fetched = fetcher.fetch(url, headers).await?;
    let status = fetched.response.status();

    if !status.is_success() {
        error!("{} {} rejected with {}", portal, action, status);
        return Err(Error::UpstreamRejected {
            status: status.as_u16(),
        });
    }

    let text = fetched.response.text().await.map_err(|e| {
        error!("failed to read {} {} body: {}", portal, action, e);
        Error::FetchFailed(format!("failed to read portal body: {}", e))
    })?;

    debug!("{} {} returned {} bytes", portal, action, text.len());
    Ok(text)
}

/// empty and non-json bodies become `PortalProtocolError` with an excerpt instead of a panic
pub(crate) fn parse_body<T: DeserializeOwned>(text: &str, action: &str) -> AppResult<T> {
    if text.trim().is_empty() {
        return Err(Error::portal_protocol(
            format!("{} returned an empty body", action),
            text,
        ));
    }

    serde_json::from_str(text).map_err(|e| {
        error!("failed to parse {} response: {}", action, e);
        Error::portal_protocol(format!("{} returned unparseable json: {}", action, e), text)
    })
}

/// id -> name lookup joined onto channels, unknown ids fall back to DEFAULT_GENRE
pub(crate) fn genre_name(genres: &HashMap<String, String>, id: Option<&str>) -> String {
    id.and_then(|id| genres.get(id))
        .cloned()
        .unwrap_or_else(|| DEFAULT_GENRE.to_string())
}

// portals can't agree on whether ids are strings or numbers
pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(D::Error::custom("expected string or number")),
    }
}

pub(crate) fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Ok(None),
    }
}
