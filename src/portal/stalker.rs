use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, COOKIE, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
    Channel, ChannelListing, Genre, PortalClient, PortalCredentials, PortalSession, StreamFormat,
    deserialize_id, deserialize_optional_id, fetch_text, genre_name, parse_body,
};
use crate::server::{
    error::{AppResult, Error},
    services::origin_services::OriginFetcher,
};

// portals check this, a desktop UA gets you nothing
const STB_USER_AGENT: &str = "Mozilla/5.0 (QtEmbedded; U; Linux; C) AppleWebKit/533.3 (KHTML, like Gecko) MAG200 stbapp ver: 2 rev: 250 Safari/533.3";
const STB_X_USER_AGENT: &str = "Model: MAG250; Link: WiFi";

/// create_link hands back a shell command, these are the programs seen in the wild so far.
/// nothing documents this so anything else passes through whole
const KNOWN_PROGRAM_PREFIXES: [&str; 2] = ["ffmpeg ", "ffrt "];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StalkerState {
    Unauthenticated,
    Handshaking,
    Authenticated(PortalSession),
}

#[derive(Deserialize)]
struct Envelope<T> {
    js: T,
}

#[derive(Deserialize)]
struct HandshakeBody {
    #[serde(default)]
    token: String,
}

#[derive(Deserialize)]
struct ChannelsPage {
    #[serde(default)]
    data: Vec<StalkerChannel>,
}

#[derive(Deserialize)]
struct StalkerChannel {
    #[serde(deserialize_with = "deserialize_id")]
    id: String,
    name: String,
    #[serde(default)]
    cmd: String,
    #[serde(default)]
    logo: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    tv_genre_id: Option<String>,
}

#[derive(Deserialize)]
struct StalkerGenre {
    #[serde(deserialize_with = "deserialize_id")]
    id: String,
    title: String,
}

#[derive(Deserialize)]
struct CreateLinkBody {
    #[serde(default)]
    cmd: String,
}

/// strips the leading program token off a create_link command and keeps the first word after it
pub fn extract_stream_url(raw: &str) -> String {
    let trimmed = raw.trim();

    KNOWN_PROGRAM_PREFIXES
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or(trimmed)
        .to_string()
}

pub struct StalkerAdapter {
    endpoint: String,
    mac: String,
    fetcher: OriginFetcher,
    state: Mutex<StalkerState>,
}

impl StalkerAdapter {
    pub fn new(portal_url: &str, mac: &str, fetcher: OriginFetcher) -> Self {
        let portal_url = portal_url.trim();
        // some configs point at load.php/portal.php directly, others just at the host
        let endpoint = if portal_url.ends_with(".php") {
            portal_url.to_string()
        } else {
            format!("{}/portal.php", portal_url.trim_end_matches('/'))
        };

        Self {
            endpoint,
            mac: mac.trim().to_string(),
            fetcher,
            state: Mutex::new(StalkerState::Unauthenticated),
        }
    }

    pub async fn state(&self) -> StalkerState {
        self.state.lock().await.clone()
    }

    fn url(&self, kind: &str, action: &str, extra: &[(&str, &str)]) -> AppResult<String> {
        let mut url = Url::parse(&self.endpoint).map_err(|e| {
            error!("invalid stalker portal url {}: {}", self.endpoint, e);
            Error::PortalUnreachable(format!("invalid portal url: {}", e))
        })?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("type", kind).append_pair("action", action);
            for (key, value) in extra {
                query.append_pair(key, value);
            }
            query.append_pair("JsHttpRequest", "1-xml");
        }

        Ok(url.to_string())
    }

    fn headers(&self, token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(STB_USER_AGENT));
        headers.insert("X-User-Agent", HeaderValue::from_static(STB_X_USER_AGENT));

        let cookie = format!("mac={}; stb_lang=en; timezone=UTC", self.mac);
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                headers.insert(COOKIE, value);
            }
            Err(e) => warn!("mac doesn't fit in a cookie header: {}", e),
        }

        if let Some(value) =
            token.and_then(|t| HeaderValue::from_str(&format!("Bearer {}", t)).ok())
        {
            headers.insert(AUTHORIZATION, value);
        }

        headers
    }

    /// Unauthenticated -> Handshaking -> Authenticated. empty or garbage bodies are fatal
    pub async fn handshake(&self) -> AppResult<String> {
        let url = self.url("stb", "handshake", &[("token", "")])?;

        let text = fetch_text(&self.fetcher, &url, &self.headers(None), "stalker", "handshake")
            .await
            .map_err(|e| match e {
                Error::FetchFailed(msg) => Error::PortalUnreachable(msg),
                Error::UpstreamRejected { status } => {
                    Error::PortalUnreachable(format!("handshake rejected with {}", status))
                }
                other => other,
            })?;

        if text.trim().is_empty() {
            return Err(Error::PortalUnreachable(
                "handshake returned an empty body".to_string(),
            ));
        }

        let body: Envelope<HandshakeBody> = serde_json::from_str(&text).map_err(|e| {
            error!("unparseable handshake: {}", e);
            Error::PortalUnreachable(format!("handshake returned unparseable json: {}", e))
        })?;

        if body.js.token.is_empty() {
            return Err(Error::PortalUnreachable(
                "handshake returned no token".to_string(),
            ));
        }

        info!("stalker handshake ok");
        Ok(body.js.token)
    }

    /// some portals list channels without this, so failures only get logged
    pub async fn auth(&self, token: &str) {
        let params = [("login", ""), ("password", ""), ("device_id", "")];
        let url = match self.url("stb", "do_auth", &params) {
            Ok(url) => url,
            Err(e) => {
                warn!("skipping stalker do_auth: {}", e);
                return;
            }
        };

        let headers = self.headers(Some(token));
        match fetch_text(&self.fetcher, &url, &headers, "stalker", "do_auth").await {
            Ok(_) => debug!("stalker do_auth ok"),
            Err(e) => warn!("stalker do_auth failed, carrying on: {}", e),
        }
    }

    async fn ensure_session(&self) -> AppResult<String> {
        let mut state = self.state.lock().await;

        if let StalkerState::Authenticated(PortalSession {
            token: Some(token), ..
        }) = &*state
        {
            return Ok(token.clone());
        }

        // held across the handshake so concurrent callers wait for one token instead of racing
        *state = StalkerState::Handshaking;
        let token = match self.handshake().await {
            Ok(token) => token,
            Err(e) => {
                *state = StalkerState::Unauthenticated;
                return Err(e);
            }
        };
        self.auth(&token).await;

        *state = StalkerState::Authenticated(PortalSession {
            token: Some(token.clone()),
            credentials: PortalCredentials::Mac(self.mac.clone()),
            expires_implicitly: true,
        });

        Ok(token)
    }

    /// drops the session only if it still holds the rejected token, a parallel call may
    /// already have handshaken a fresh one
    async fn invalidate(&self, rejected: &str) {
        let mut state = self.state.lock().await;

        let holds_rejected = matches!(
            &*state,
            StalkerState::Authenticated(PortalSession { token: Some(token), .. }) if token == rejected
        );
        if holds_rejected {
            *state = StalkerState::Unauthenticated;
        }
    }

    async fn itv_call_once<T: DeserializeOwned>(
        &self,
        action: &str,
        extra: &[(&str, &str)],
        token: &str,
    ) -> AppResult<T> {
        let url = self.url("itv", action, extra)?;
        let headers = self.headers(Some(token));
        let text = fetch_text(&self.fetcher, &url, &headers, "stalker", action).await?;

        // expired tokens usually come back as a 200 with this plain text
        if text.contains("Authorization failed") {
            return Err(Error::UpstreamRejected { status: 401 });
        }

        parse_body::<Envelope<T>>(&text, action).map(|envelope| envelope.js)
    }

    /// one re-handshake when the portal says the session is gone, then give up
    async fn itv_call<T: DeserializeOwned>(
        &self,
        action: &str,
        extra: &[(&str, &str)],
    ) -> AppResult<T> {
        let token = self.ensure_session().await?;

        match self.itv_call_once(action, extra, &token).await {
            Err(Error::UpstreamRejected { status: 401 | 403 }) => {
                warn!("stalker session rejected on {}, handshaking again", action);
                self.invalidate(&token).await;
                let token = self.ensure_session().await?;
                self.itv_call_once(action, extra, &token).await
            }
            result => result,
        }
    }
}

#[async_trait]
impl PortalClient for StalkerAdapter {
    async fn list_channels(&self) -> AppResult<ChannelListing> {
        self.ensure_session().await?;

        let (page, raw_genres) = tokio::try_join!(
            self.itv_call::<ChannelsPage>("get_all_channels", &[]),
            self.itv_call::<Vec<StalkerGenre>>("get_genres", &[]),
        )?;

        let genre_map: HashMap<String, String> = raw_genres
            .iter()
            .map(|g| (g.id.clone(), g.title.clone()))
            .collect();

        let channels: Vec<Channel> = page
            .data
            .into_iter()
            .map(|ch| {
                let manifest_kind =
                    StreamFormat::from_url(&extract_stream_url(&ch.cmd), StreamFormat::Hls);
                Channel {
                    genre: genre_name(&genre_map, ch.tv_genre_id.as_deref()),
                    id: ch.id,
                    name: ch.name,
                    logo: ch.logo.filter(|l| !l.is_empty()),
                    upstream_command: ch.cmd,
                    manifest_kind,
                    drm: None,
                    user_agent: None,
                    referrer: None,
                    use_proxy: true,
                }
            })
            .collect();

        let genres = raw_genres
            .into_iter()
            .map(|g| Genre {
                id: g.id,
                name: g.title,
            })
            .collect();

        info!("stalker listed {} channels", channels.len());
        Ok(ChannelListing { channels, genres })
    }

    async fn resolve_stream(&self, command: &str) -> AppResult<String> {
        let link: CreateLinkBody = self
            .itv_call(
                "create_link",
                &[("cmd", command), ("forced_storage", "0"), ("disable_ad", "0")],
            )
            .await?;

        if link.cmd.trim().is_empty() {
            return Err(Error::portal_protocol("create_link returned no cmd", ""));
        }

        let url = extract_stream_url(&link.cmd);
        debug!("stalker resolved {} -> {}", command, url);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_stream_url() {
        assert_eq!(
            extract_stream_url("ffmpeg http://srv/ch1/token123 timeout=5"),
            "http://srv/ch1/token123"
        );
        assert_eq!(
            extract_stream_url("ffrt http://srv/ch2.m3u8"),
            "http://srv/ch2.m3u8"
        );
        assert_eq!(
            extract_stream_url("auto http://srv/ch3 x=1"),
            "auto http://srv/ch3 x=1"
        );
    }

    #[test]
    fn test_endpoint_gets_portal_php() {
        let adapter = StalkerAdapter::new(
            "http://portal.example/c/",
            "00:1A:79:00:00:01",
            OriginFetcher::new(),
        );
        let url = adapter.url("stb", "handshake", &[("token", "")]).unwrap();

        assert!(url.starts_with("http://portal.example/c/portal.php?type=stb&action=handshake"));
        assert!(url.ends_with("JsHttpRequest=1-xml"));
    }
}
