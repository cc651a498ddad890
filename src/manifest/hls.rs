use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::ProxyUrlBuilder;

// EXT-X-KEY, EXT-X-MAP, EXT-X-MEDIA and friends all carry their reference this way
static URI_ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"URI="([^"]*)""#).expect("URI attribute regex should compile"));

/// line-oriented m3u8 rewrite, tags without a URI attribute pass through untouched
pub fn rewrite(raw_text: &str, base_url: &str, builder: &ProxyUrlBuilder) -> String {
    let mut out = String::with_capacity(raw_text.len() * 2);

    for line in raw_text.lines() {
        let trimmed = line.trim();

        if trimmed.is_empty() {
            out.push_str(line);
        } else if trimmed.starts_with('#') {
            if trimmed.contains("URI=\"") {
                let rewritten = URI_ATTRIBUTE.replace_all(line, |caps: &Captures| {
                    format!("URI=\"{}\"", builder.proxy(&caps[1], base_url))
                });
                out.push_str(&rewritten);
            } else {
                out.push_str(line);
            }
        } else {
            out.push_str(&builder.proxy(trimmed, base_url));
        }

        out.push('\n');
    }

    if !raw_text.ends_with('\n') {
        out.pop();
    }

    out
}
