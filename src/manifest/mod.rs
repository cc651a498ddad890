//! Manifest rewriting. Pure string work, no I/O: the proxy hands in a fully buffered manifest
//! and gets back the same document with every segment, key and sub-manifest reference pointed
//! at the proxy.

pub mod dash;
pub mod hls;
mod proxy_url;

use serde::{Deserialize, Serialize};

pub use proxy_url::{ProxyUrlBuilder, base_directory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    Hls,
    Dash,
}

impl ManifestKind {
    /// extension of the requested url wins, content type is only consulted when the url says
    /// nothing. `None` means media, stream it through untouched
    pub fn detect(request_url: &str, content_type: Option<&str>) -> Option<Self> {
        let path = url::Url::parse(request_url)
            .map(|u| u.path().to_ascii_lowercase())
            .unwrap_or_else(|_| {
                request_url
                    .split(['?', '#'])
                    .next()
                    .unwrap_or_default()
                    .to_ascii_lowercase()
            });

        if path.ends_with(".m3u8") {
            return Some(Self::Hls);
        }
        if path.ends_with(".mpd") {
            return Some(Self::Dash);
        }

        let content_type = content_type?.to_ascii_lowercase();
        if content_type.contains("mpegurl") {
            Some(Self::Hls)
        } else if content_type.contains("dash+xml") {
            Some(Self::Dash)
        } else {
            None
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Hls => "application/vnd.apple.mpegurl",
            Self::Dash => "application/dash+xml",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hls => "hls",
            Self::Dash => "dash",
        }
    }
}

/// a manifest as fetched, lives for one proxy request
#[derive(Debug, Clone)]
pub struct ManifestDocument {
    pub kind: ManifestKind,
    pub base_url: String,
    pub raw_text: String,
}

impl ManifestDocument {
    pub fn rewrite(&self, builder: &ProxyUrlBuilder) -> String {
        rewrite(&self.raw_text, self.kind, &self.base_url, builder)
    }
}

pub fn rewrite(
    raw_text: &str,
    kind: ManifestKind,
    base_url: &str,
    builder: &ProxyUrlBuilder,
) -> String {
    // a leading BOM would make the #EXTM3U header look like a uri line
    let raw_text = raw_text.strip_prefix('\u{feff}').unwrap_or(raw_text);

    match kind {
        ManifestKind::Hls => hls::rewrite(raw_text, base_url, builder),
        ManifestKind::Dash => dash::rewrite(raw_text, base_url, builder),
    }
}
