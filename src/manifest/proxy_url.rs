use url::Url;

/// Builds `<proxy_base>?url=<encoded>` links and carries the caller's spoofed identity
/// (`ua`, `referer`, `cookie`) onto every link so segment and key fetches look the same
/// upstream as the manifest fetch did.
///
/// It also owns URI resolution, because deciding what a reference points to needs to know
/// what the proxy's own links look like (already-proxied links and paths a player resolved
/// against the proxy instead of the manifest both have to be re-based onto the origin).
#[derive(Debug, Clone)]
pub struct ProxyUrlBuilder {
    proxy_base: String,
    proxy_origin: Option<String>,
    proxy_path: String,
    identity: Vec<(&'static str, String)>,
}

impl ProxyUrlBuilder {
    /// `proxy_base` is either absolute (`https://edge.example/proxy`) or a bare path (`/proxy`)
    pub fn new(proxy_base: impl Into<String>) -> Self {
        let proxy_base = proxy_base.into();
        let proxy_base = proxy_base.trim_end_matches('/').to_string();

        let (proxy_origin, proxy_path) = match Url::parse(&proxy_base) {
            Ok(parsed) if parsed.has_host() => (
                Some(parsed.origin().ascii_serialization()),
                parsed.path().trim_end_matches('/').to_string(),
            ),
            _ => (None, proxy_base.clone()),
        };

        Self {
            proxy_base,
            proxy_origin,
            proxy_path,
            identity: Vec::new(),
        }
    }

    /// empty and missing values are skipped so links stay short
    pub fn with_param(mut self, name: &'static str, value: Option<&str>) -> Self {
        if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
            self.identity.push((name, value.to_string()));
        }
        self
    }

    pub fn proxy_base(&self) -> &str {
        &self.proxy_base
    }

    /// wraps an absolute upstream url into a proxy link
    pub fn build(&self, absolute_url: &str) -> String {
        let separator = if self.proxy_base.contains('?') { '&' } else { '?' };
        let mut link = format!(
            "{}{}url={}",
            self.proxy_base,
            separator,
            urlencoding::encode(absolute_url)
        );
        for (name, value) in &self.identity {
            link.push('&');
            link.push_str(name);
            link.push('=');
            link.push_str(&urlencoding::encode(value));
        }
        link
    }

    /// resolve then wrap, what every rewritten reference goes through
    pub fn proxy(&self, reference: &str, base_url: &str) -> String {
        self.build(&self.resolve(reference, base_url))
    }

    /// turns a manifest reference into the absolute upstream url it means
    pub fn resolve(&self, reference: &str, base_url: &str) -> String {
        let reference = reference.trim();

        if let Some(original) = self.unwrap_proxied(reference) {
            return original;
        }

        if let Some(rebased) = self.strip_own_origin(reference) {
            return join_relative(base_url, &rebased);
        }

        if reference.starts_with("http") {
            return reference.to_string();
        }

        join_relative(base_url, reference)
    }

    /// `https://edge/proxy?url=X&ua=..` gives back X. a bare `/proxy?url=X` only counts as
    /// ours when the builder itself is path-only, otherwise it is the upstream's own link
    fn unwrap_proxied(&self, reference: &str) -> Option<String> {
        let query = reference
            .strip_prefix(self.proxy_base.as_str())
            .or_else(|| {
                self.proxy_origin.as_ref().and_then(|origin| {
                    reference
                        .strip_prefix(origin.as_str())
                        .and_then(|rest| rest.strip_prefix(self.proxy_path.as_str()))
                })
            })?
            .strip_prefix('?')?;

        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "url")
            .map(|(_, value)| value.into_owned())
            .filter(|value| value.starts_with("http"))
    }

    /// a path the player resolved against us instead of against the manifest, e.g.
    /// `https://edge/proxy/chunk1.ts`, comes back as `chunk1.ts`
    fn strip_own_origin(&self, reference: &str) -> Option<String> {
        let origin = self.proxy_origin.as_ref()?;
        let rest = reference.strip_prefix(origin.as_str())?;

        let rest = match rest.strip_prefix(self.proxy_path.as_str()) {
            Some(after) if !self.proxy_path.is_empty() && (after.is_empty() || after.starts_with('/')) => after,
            _ => rest,
        };

        Some(rest.trim_start_matches('/').to_string())
    }
}

/// the manifest url cut after its last `/`, query and fragment dropped
pub fn base_directory(manifest_url: &str) -> String {
    let without_query = manifest_url
        .split(['?', '#'])
        .next()
        .unwrap_or(manifest_url);
    match without_query.rfind('/') {
        Some(idx) => without_query[..=idx].to_string(),
        None => without_query.to_string(),
    }
}

fn join_relative(base_url: &str, reference: &str) -> String {
    match Url::parse(base_url).and_then(|base| base.join(reference)) {
        Ok(resolved) => resolved.to_string(),
        // not a parseable base, fall back to plain prefixing
        Err(_) => format!("{}{}", base_directory(base_url), reference),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = "https://cdn.example/path/live.m3u8";

    #[test]
    fn test_build_encodes_target_and_identity() {
        let builder = ProxyUrlBuilder::new("https://edge.example/proxy")
            .with_param("ua", Some("VLC/3.0"))
            .with_param("referer", None);

        assert_eq!(
            builder.build("https://cdn.example/a b.ts"),
            "https://edge.example/proxy?url=https%3A%2F%2Fcdn.example%2Fa%20b.ts&ua=VLC%2F3.0"
        );
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let builder = ProxyUrlBuilder::new("https://edge.example/proxy");

        assert_eq!(
            builder.resolve("chunk1.ts", MANIFEST),
            "https://cdn.example/path/chunk1.ts"
        );
        assert_eq!(
            builder.resolve("http://other.example/x.ts", MANIFEST),
            "http://other.example/x.ts"
        );
    }

    #[test]
    fn test_resolve_rebases_paths_resolved_against_proxy() {
        let builder = ProxyUrlBuilder::new("https://edge.example/proxy");

        assert_eq!(
            builder.resolve("https://edge.example/proxy/chunk1.ts", MANIFEST),
            "https://cdn.example/path/chunk1.ts"
        );
        assert_eq!(
            builder.resolve("https://edge.example/low/chunk1.ts", MANIFEST),
            "https://cdn.example/path/low/chunk1.ts"
        );
    }

    #[test]
    fn test_resolve_unwraps_existing_proxy_links() {
        let builder = ProxyUrlBuilder::new("https://edge.example/proxy").with_param("ua", Some("x"));
        let link = builder.build("https://cdn.example/path/chunk1.ts");

        assert_eq!(
            builder.resolve(&link, MANIFEST),
            "https://cdn.example/path/chunk1.ts"
        );

        let path_only = ProxyUrlBuilder::new("/proxy");
        assert_eq!(
            path_only.resolve("/proxy?url=https%3A%2F%2Fcdn.example%2Fk.key", MANIFEST),
            "https://cdn.example/k.key"
        );
    }

    #[test]
    fn test_resolve_keeps_upstream_proxy_links_on_their_origin() {
        let builder = ProxyUrlBuilder::new("https://edge.example/proxy");

        assert_eq!(
            builder.resolve(
                "/proxy?url=https%3A%2F%2Fcdn.example%2Fseg.ts",
                "https://other.example/live.m3u8"
            ),
            "https://other.example/proxy?url=https%3A%2F%2Fcdn.example%2Fseg.ts"
        );
        assert_eq!(
            builder.proxy(
                "/proxy?url=https%3A%2F%2Fcdn.example%2Fseg.ts",
                "https://other.example/live.m3u8"
            ),
            "https://edge.example/proxy?url=https%3A%2F%2Fother.example%2Fproxy%3Furl%3Dhttps%253A%252F%252Fcdn.example%252Fseg.ts"
        );
    }

    #[test]
    fn test_base_directory() {
        assert_eq!(
            base_directory("https://cdn.example/path/live.m3u8?token=a/b"),
            "https://cdn.example/path/"
        );
    }
}
