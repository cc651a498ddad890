// the stream proxy: manifests get buffered and rewritten, everything else is piped through
use std::io::{Read, Write};

use axum::{
    Extension, Router,
    body::Body,
    extract::Query,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use futures::TryStreamExt;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    manifest::{ManifestDocument, ManifestKind, ProxyUrlBuilder},
    server::{
        error::{AppResult, Error},
        services::edge_services::EdgeServices,
    },
};

/// where rewritten links point, the proxy is also reachable at `/` but links always use this
pub const PROXY_PATH: &str = "/proxy";

/// response compression for rewritten manifests
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ContentEncoding {
    Zstd,
    Gzip,
    None,
}

impl ContentEncoding {
    /// players that send "identity" get identity, zstd beats gzip when both are on offer
    pub fn from_accept_encoding(accept_encoding: Option<&str>) -> Self {
        match accept_encoding {
            Some(v) => {
                if v == "identity" || v.starts_with("identity,") {
                    return Self::None;
                }
                if v.contains("zstd") {
                    Self::Zstd
                } else if v.contains("gzip") {
                    Self::Gzip
                } else {
                    Self::None
                }
            }
            None => Self::None,
        }
    }

    fn as_header_value(&self) -> Option<&'static str> {
        match self {
            Self::Zstd => Some("zstd"),
            Self::Gzip => Some("gzip"),
            Self::None => None,
        }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        match self {
            Self::Zstd => zstd::encode_all(data, 3),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            Self::None => Ok(data.to_vec()),
        }
    }
}

/// undo whatever content-encoding the upstream put on a manifest before we touch it
pub fn decode_body(bytes: &[u8], content_encoding: Option<&str>) -> AppResult<Vec<u8>> {
    match content_encoding {
        Some("zstd") => zstd::decode_all(bytes).map_err(|e| {
            error!("Failed to decompress zstd manifest: {}", e);
            Error::InternalServerErrorWithContext("Failed to decompress manifest".to_string())
        }),
        Some("gzip") => {
            let mut decoder = GzDecoder::new(bytes);
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed).map_err(|e| {
                error!("Failed to decompress gzip manifest: {}", e);
                Error::InternalServerErrorWithContext("Failed to decompress manifest".to_string())
            })?;
            Ok(decompressed)
        }
        _ => Ok(bytes.to_vec()),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ProxyQuery {
    url: Option<String>,
    ua: Option<String>,
    referer: Option<String>,
    cookie: Option<String>,
}

// media headers worth passing back to the player
const FORWARDED_MEDIA_HEADERS: [HeaderName; 6] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ACCEPT_RANGES,
    header::CONTENT_ENCODING,
    header::CACHE_CONTROL,
];

pub struct ProxyController;

impl ProxyController {
    pub fn app() -> Router {
        Router::new().route("/", get(Self::proxy_get).options(Self::proxy_options))
    }

    async fn proxy_get(
        Extension(services): Extension<EdgeServices>,
        Query(params): Query<ProxyQuery>,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let target_url = Self::validate_target(params.url.as_deref())?;

        let upstream_headers = Self::upstream_headers(
            &params,
            &headers,
            &services.config.default_user_agent,
        );

        debug!("Proxying: {}", target_url);
        let fetched = services.fetcher.fetch(&target_url, &upstream_headers).await?;
        let response = fetched.response;

        let status = response.status();
        if status.is_redirection() {
            // a 3xx the fetcher could not follow (304, no Location) has no body worth mirroring
            error!("Upstream {} answered {} with nowhere to go", target_url, status);
            return Err(Error::FetchFailed(format!(
                "upstream answered {} without a usable location",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            // upstream bodies here are mostly cloudflare html, not worth logging
            error!("Upstream {} answered {}", target_url, status);
            metrics::counter!("relay_upstream_rejected_total").increment(1);
            return Err(Error::UpstreamRejected {
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let kind = ManifestKind::detect(&target_url, None)
            .or_else(|| ManifestKind::detect(&fetched.final_url, content_type.as_deref()));

        match kind {
            Some(kind) => {
                metrics::counter!("relay_proxy_requests_total", "kind" => kind.as_str())
                    .increment(1);

                let content_encoding = response
                    .headers()
                    .get(header::CONTENT_ENCODING)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());

                let bytes = response.bytes().await.map_err(|e| {
                    error!("Failed to read manifest body: {}", e);
                    Error::FetchFailed(format!("Failed to read manifest: {}", e))
                })?;
                let decoded = decode_body(&bytes, content_encoding.as_deref())?;

                let document = ManifestDocument {
                    kind,
                    base_url: fetched.final_url,
                    raw_text: String::from_utf8_lossy(&decoded).into_owned(),
                };

                let builder = ProxyUrlBuilder::new(Self::public_proxy_base(
                    services.config.public_base_url.as_deref(),
                    &headers,
                ))
                .with_param("ua", params.ua.as_deref())
                .with_param("referer", params.referer.as_deref())
                .with_param("cookie", params.cookie.as_deref());

                let rewritten = document.rewrite(&builder);
                debug!(
                    "Rewrote {} manifest, {} -> {} bytes",
                    kind.as_str(),
                    document.raw_text.len(),
                    rewritten.len()
                );

                Self::build_manifest_response(kind, &rewritten, &headers)
            }
            None => {
                metrics::counter!("relay_proxy_requests_total", "kind" => "media").increment(1);
                Ok(Self::build_media_response(response))
            }
        }
    }

    async fn proxy_options() -> impl IntoResponse {
        (
            StatusCode::NO_CONTENT,
            [
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS"),
                (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
            ],
        )
    }

    /// query values arrive decoded once, a double-encoded url gets one more pass
    pub fn validate_target(url_param: Option<&str>) -> AppResult<String> {
        let raw = url_param
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::BadRequest("Missing url parameter".to_string()))?;

        let decoded = if raw.starts_with("http://") || raw.starts_with("https://") {
            raw.to_string()
        } else {
            urlencoding::decode(raw)
                .map(|s| s.into_owned())
                .map_err(|_| Error::BadRequest("Invalid URL encoding".to_string()))?
        };

        match Url::parse(&decoded) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => {
                Ok(decoded)
            }
            _ => Err(Error::BadRequest("Invalid URL format".to_string())),
        }
    }

    /// the caller's spoofed identity plus a forwarded Range
    pub fn upstream_headers(
        params: &ProxyQuery,
        incoming: &HeaderMap,
        default_user_agent: &str,
    ) -> HeaderMap {
        let mut upstream = HeaderMap::new();

        let user_agent = params
            .ua
            .as_deref()
            .filter(|ua| !ua.is_empty())
            .unwrap_or(default_user_agent);
        if let Ok(value) = HeaderValue::from_str(user_agent) {
            upstream.insert(header::USER_AGENT, value);
        }
        upstream.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        if let Some(referer) = params.referer.as_deref().filter(|r| !r.is_empty()) {
            if let Ok(value) = HeaderValue::from_str(referer) {
                upstream.insert(header::REFERER, value);
            }
            // some cdns check Origin instead of Referer
            let origin = Url::parse(referer)
                .ok()
                .map(|u| u.origin().ascii_serialization())
                .filter(|o| o != "null");
            if let Some(value) = origin.and_then(|o| HeaderValue::from_str(&o).ok()) {
                upstream.insert(header::ORIGIN, value);
            }
        }

        if let Some(cookie) = params.cookie.as_deref().filter(|c| !c.is_empty()) {
            if let Ok(value) = HeaderValue::from_str(cookie) {
                upstream.insert(header::COOKIE, value);
            }
        }

        if let Some(range) = incoming.get(header::RANGE) {
            upstream.insert(header::RANGE, range.clone());
        }

        upstream
    }

    /// configured public url if there is one, otherwise whatever the caller reached us on
    pub fn public_proxy_base(public_base_url: Option<&str>, incoming: &HeaderMap) -> String {
        if let Some(base) = public_base_url.map(str::trim).filter(|b| !b.is_empty()) {
            return format!("{}{}", base.trim_end_matches('/'), PROXY_PATH);
        }

        let header_str = |name: &str| {
            incoming
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let host = header_str("x-forwarded-host").or_else(|| header_str(header::HOST.as_str()));
        match host {
            Some(host) => {
                let proto = header_str("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
                format!("{}://{}{}", proto, host, PROXY_PATH)
            }
            // relative links still work for players that resolve against the manifest url
            None => PROXY_PATH.to_string(),
        }
    }

    fn build_manifest_response(
        kind: ManifestKind,
        body: &str,
        headers: &HeaderMap,
    ) -> AppResult<Response> {
        let encoding = ContentEncoding::from_accept_encoding(
            headers
                .get(header::ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok()),
        );

        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(kind.content_type()),
        );
        response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response_headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );

        let response_body = match encoding.as_header_value() {
            Some(encoding_name) => {
                let compressed = encoding.compress(body.as_bytes()).map_err(|e| {
                    error!("Failed to compress manifest with {:?}: {}", encoding, e);
                    Error::InternalServerErrorWithContext("Failed to compress response".to_string())
                })?;
                response_headers.insert(
                    header::CONTENT_ENCODING,
                    HeaderValue::from_static(encoding_name),
                );
                compressed
            }
            None => body.as_bytes().to_vec(),
        };

        response_headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from(response_body.len()),
        );

        Ok((StatusCode::OK, response_headers, response_body).into_response())
    }

    /// media goes through as a stream, status (200/206) and range headers mirrored
    fn build_media_response(response: reqwest::Response) -> Response {
        let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::OK);

        let mut response_headers = HeaderMap::new();
        for name in FORWARDED_MEDIA_HEADERS.iter() {
            if let Some(value) = response.headers().get(name) {
                response_headers.insert(name.clone(), value.clone());
            }
        }
        if !response_headers.contains_key(header::CONTENT_TYPE) {
            response_headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
        }
        response_headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );

        info!("Streaming media ({})", status);
        // headers are gone by the time the stream breaks, all we can do is log and cut it
        let stream = response
            .bytes_stream()
            .inspect_err(|e| warn!("Upstream media stream broke: {}", e));
        (status, response_headers, Body::from_stream(stream)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_disables_compression() {
        assert_eq!(
            ContentEncoding::from_accept_encoding(Some("identity")),
            ContentEncoding::None
        );
        assert_eq!(
            ContentEncoding::from_accept_encoding(Some("gzip, deflate, zstd")),
            ContentEncoding::Zstd
        );
        assert_eq!(
            ContentEncoding::from_accept_encoding(Some("gzip, deflate")),
            ContentEncoding::Gzip
        );
        assert_eq!(ContentEncoding::from_accept_encoding(None), ContentEncoding::None);
    }

    #[test]
    fn test_gzip_manifest_decodes() {
        let body = "#EXTM3U\nseg.ts\n";
        let compressed = ContentEncoding::Gzip.compress(body.as_bytes()).unwrap();
        let decoded = decode_body(&compressed, Some("gzip")).unwrap();
        assert_eq!(decoded, body.as_bytes());
    }

    #[test]
    fn test_validate_target() {
        assert!(matches!(
            ProxyController::validate_target(None),
            Err(Error::BadRequest(_))
        ));
        assert!(matches!(
            ProxyController::validate_target(Some("ftp://x/a")),
            Err(Error::BadRequest(_))
        ));
        assert_eq!(
            ProxyController::validate_target(Some("https%3A%2F%2Fcdn.example%2Fa.m3u8")).unwrap(),
            "https://cdn.example/a.m3u8"
        );
    }

    #[test]
    fn test_referer_also_sets_origin() {
        let params = ProxyQuery {
            url: None,
            ua: Some("VLC/3.0".to_string()),
            referer: Some("https://site.example/watch/1".to_string()),
            cookie: Some("a=b".to_string()),
        };
        let mut incoming = HeaderMap::new();
        incoming.insert(header::RANGE, HeaderValue::from_static("bytes=0-99"));

        let upstream = ProxyController::upstream_headers(&params, &incoming, "default");
        assert_eq!(upstream[header::USER_AGENT], "VLC/3.0");
        assert_eq!(upstream[header::ORIGIN], "https://site.example");
        assert_eq!(upstream[header::COOKIE], "a=b");
        assert_eq!(upstream[header::RANGE], "bytes=0-99");
    }

    #[test]
    fn test_public_proxy_base() {
        let mut incoming = HeaderMap::new();
        assert_eq!(ProxyController::public_proxy_base(None, &incoming), "/proxy");

        incoming.insert(header::HOST, HeaderValue::from_static("edge.local:5000"));
        assert_eq!(
            ProxyController::public_proxy_base(None, &incoming),
            "http://edge.local:5000/proxy"
        );

        incoming.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert_eq!(
            ProxyController::public_proxy_base(Some("https://relay.example/"), &incoming),
            "https://relay.example/proxy"
        );
    }
}
