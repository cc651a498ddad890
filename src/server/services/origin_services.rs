use std::time::Duration;

use reqwest::{
    Client,
    header::{HeaderMap, LOCATION},
    redirect::Policy,
};
use tracing::{debug, error, warn};
use url::Url;

use crate::server::error::{AppResult, Error};

/// redirect loops from misbehaving upstreams stop here
pub const MAX_REDIRECT_HOPS: usize = 5;

pub struct FetchedResponse {
    pub response: reqwest::Response,
    /// url that produced `response`, what relative manifest references resolve against
    pub final_url: String,
    /// redirects followed by hand before the response
    pub hops: usize,
}

/// upstream fetcher that follows redirects itself so relative `Location`s resolve against the
/// url that issued them instead of the original one
#[derive(Clone)]
pub struct OriginFetcher {
    manual: Client,
    // only for the one last fetch after the hop budget is spent
    follow: Client,
}

impl Default for OriginFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl OriginFetcher {
    /// no timeout, the stream proxy leans on the platform default
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Some(timeout))
    }

    fn build(timeout: Option<Duration>) -> Self {
        let builder = || {
            let builder = Client::builder();
            match timeout {
                Some(t) => builder.timeout(t),
                None => builder,
            }
        };

        let manual = builder()
            .redirect(Policy::none())
            .build()
            .unwrap_or_else(|e| {
                error!("failed to build manual-redirect client, using defaults: {}", e);
                Client::builder()
                    .redirect(Policy::none())
                    .build()
                    .unwrap_or_default()
            });
        let follow = builder().build().unwrap_or_default();

        Self { manual, follow }
    }

    pub async fn fetch(&self, url: &str, headers: &HeaderMap) -> AppResult<FetchedResponse> {
        let mut current = url.to_string();

        for hop in 0..MAX_REDIRECT_HOPS {
            let response = Self::send(&self.manual, &current, headers).await?;

            if !response.status().is_redirection() {
                return Ok(FetchedResponse {
                    response,
                    final_url: current,
                    hops: hop,
                });
            }

            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
            else {
                // a 3xx with nowhere to go (304 and friends), caller deals with it
                return Ok(FetchedResponse {
                    response,
                    final_url: current,
                    hops: hop,
                });
            };

            let next = resolve_location(&current, &location)?;
            debug!("hop {}: {} -> {}", hop + 1, current, next);
            metrics::counter!("relay_redirect_hops_total").increment(1);
            current = next;
        }

        warn!(
            "redirect budget of {} spent, fetching {} directly",
            MAX_REDIRECT_HOPS, current
        );
        let response = Self::send(&self.follow, &current, headers).await?;
        let final_url = response.url().to_string();

        Ok(FetchedResponse {
            response,
            final_url,
            hops: MAX_REDIRECT_HOPS,
        })
    }

    async fn send(client: &Client, url: &str, headers: &HeaderMap) -> AppResult<reqwest::Response> {
        client
            .get(url)
            .headers(headers.clone())
            .send()
            .await
            .map_err(|e| {
                error!("upstream fetch of {} failed: {}", url, e);
                metrics::counter!("relay_fetch_failed_total").increment(1);
                Error::FetchFailed(e.to_string())
            })
    }
}

/// absolute locations pass through, anything else resolves against the current hop
pub fn resolve_location(current: &str, location: &str) -> AppResult<String> {
    Url::parse(current)
        .and_then(|base| base.join(location))
        .map(|u| u.to_string())
        .map_err(|e| {
            error!("bad redirect location {} from {}: {}", location, current, e);
            Error::FetchFailed(format!("invalid redirect location: {}", e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_location() {
        assert_eq!(
            resolve_location("https://a.example/x/y/list.m3u8", "../z/list.m3u8").unwrap(),
            "https://a.example/x/z/list.m3u8"
        );
        assert_eq!(
            resolve_location("https://a.example/x/list.m3u8", "https://b.example/q").unwrap(),
            "https://b.example/q"
        );
        assert_eq!(
            resolve_location("https://a.example/x/list.m3u8", "/root.m3u8").unwrap(),
            "https://a.example/root.m3u8"
        );
    }
}
