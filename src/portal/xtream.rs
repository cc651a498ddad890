use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{error, info};
use url::Url;

use super::{
    Channel, ChannelListing, Genre, PortalClient, PortalCredentials, PortalSession, StreamFormat,
    deserialize_id, deserialize_optional_id, fetch_text, genre_name, parse_body,
};
use crate::{
    config::DEFAULT_USER_AGENT,
    server::{
        error::{AppResult, Error},
        services::origin_services::OriginFetcher,
    },
};

#[derive(Deserialize)]
struct XtreamStream {
    #[serde(deserialize_with = "deserialize_id")]
    stream_id: String,
    name: String,
    #[serde(default)]
    stream_icon: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    category_id: Option<String>,
}

#[derive(Deserialize)]
struct XtreamCategory {
    #[serde(deserialize_with = "deserialize_id")]
    category_id: String,
    category_name: String,
}

/// stateless, credentials ride along on every call
pub struct XtreamAdapter {
    server: String,
    username: String,
    password: String,
    fetcher: OriginFetcher,
}

impl XtreamAdapter {
    pub fn new(server: &str, username: &str, password: &str, fetcher: OriginFetcher) -> Self {
        Self {
            server: server.trim().trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            fetcher,
        }
    }

    pub fn session(&self) -> PortalSession {
        PortalSession {
            token: None,
            credentials: PortalCredentials::Account {
                username: self.username.clone(),
                password: self.password.clone(),
            },
            expires_implicitly: false,
        }
    }

    fn api_url(&self, action: &str) -> AppResult<String> {
        let mut url = Url::parse(&format!("{}/player_api.php", self.server)).map_err(|e| {
            error!("invalid xtream server url {}: {}", self.server, e);
            Error::PortalUnreachable(format!("invalid portal url: {}", e))
        })?;

        url.query_pairs_mut()
            .append_pair("username", &self.username)
            .append_pair("password", &self.password)
            .append_pair("action", action);

        Ok(url.to_string())
    }

    async fn get<T: DeserializeOwned>(&self, action: &str) -> AppResult<T> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let url = self.api_url(action)?;
        let text = fetch_text(&self.fetcher, &url, &headers, "xtream", action).await?;
        parse_body(&text, action)
    }
}

#[async_trait]
impl PortalClient for XtreamAdapter {
    async fn list_channels(&self) -> AppResult<ChannelListing> {
        let (streams, categories) = tokio::try_join!(
            self.get::<Vec<XtreamStream>>("get_live_streams"),
            self.get::<Vec<XtreamCategory>>("get_live_categories"),
        )?;

        let category_map: HashMap<String, String> = categories
            .iter()
            .map(|c| (c.category_id.clone(), c.category_name.clone()))
            .collect();

        let channels: Vec<Channel> = streams
            .into_iter()
            .map(|stream| Channel {
                genre: genre_name(&category_map, stream.category_id.as_deref()),
                id: stream.stream_id.clone(),
                name: stream.name,
                logo: stream.stream_icon.filter(|l| !l.is_empty()),
                upstream_command: stream.stream_id,
                // resolve_stream always builds an .m3u8
                manifest_kind: StreamFormat::Hls,
                drm: None,
                user_agent: None,
                referrer: None,
                use_proxy: true,
            })
            .collect();

        let genres = categories
            .into_iter()
            .map(|c| Genre {
                id: c.category_id,
                name: c.category_name,
            })
            .collect();

        info!("xtream listed {} channels", channels.len());
        Ok(ChannelListing { channels, genres })
    }

    /// pure template, no network
    async fn resolve_stream(&self, command: &str) -> AppResult<String> {
        let stream_id = command.trim();
        if stream_id.is_empty() {
            return Err(Error::BadRequest("missing xtream stream id".to_string()));
        }

        Ok(format!(
            "{}/live/{}/{}/{}.m3u8",
            self.server, self.username, self.password, stream_id
        ))
    }
}
