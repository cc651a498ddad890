use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::ProxyUrlBuilder;

static BASE_URL_ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)(<BaseURL(?:\s[^>]*)?>)(.*?)(</BaseURL>)")
        .expect("BaseURL regex should compile")
});

static SEGMENT_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(media|initialization)="([^"]*)""#).expect("segment attribute regex should compile")
});

/// two targeted substitutions over the raw mpd, no xml parse so loose manifests survive and
/// formatting stays as the origin wrote it
pub fn rewrite(raw_text: &str, base_url: &str, builder: &ProxyUrlBuilder) -> String {
    let with_base_urls = BASE_URL_ELEMENT.replace_all(raw_text, |caps: &Captures| {
        let body = caps[2].trim();
        if body.is_empty() {
            return caps[0].to_string();
        }
        format!(
            "{}{}{}",
            &caps[1],
            xml_escape(&builder.proxy(&xml_unescape(body), base_url)),
            &caps[3]
        )
    });

    SEGMENT_ATTRIBUTE
        .replace_all(&with_base_urls, |caps: &Captures| {
            let value = &caps[2];
            // $Number$/$Time$/$RepresentationID$ are expanded by the player per segment
            if value.contains('$') || value.trim().is_empty() {
                return caps[0].to_string();
            }
            format!(
                "{}=\"{}\"",
                &caps[1],
                xml_escape(&builder.proxy(&xml_unescape(value), base_url))
            )
        })
        .into_owned()
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

// proxy links only ever need & escaped, everything else is percent-encoded already
fn xml_escape(value: &str) -> String {
    value.replace('&', "&amp;")
}
