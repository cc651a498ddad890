use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::Response,
};
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{header as header_matcher, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relay::client::ProxyCandidate;
use relay::config::AppConfig;
use relay::database::InMemoryChannelDrmRepository;
use relay::portal::{Channel, ChannelListing, DrmConfig, MockPortalClient, StreamFormat};
use relay::server::{EdgeApplicationServer, EdgeServices};

fn config() -> AppConfig {
    AppConfig {
        public_base_url: Some("https://relay.example".to_string()),
        proxy_primary: Some("https://p1.example/proxy".to_string()),
        proxy_backup: Some("https://p2.example/proxy".to_string()),
        ..AppConfig::default()
    }
}

fn services() -> EdgeServices {
    EdgeServices::new(Arc::new(config()), None).unwrap()
}

fn app() -> Router {
    EdgeApplicationServer::router(services())
}

async fn get(app: Router, uri: &str) -> Response {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

fn proxy_uri(prefix: &str, target: &str) -> String {
    format!("{}?url={}", prefix, urlencoding::encode(target))
}

#[tokio::test]
async fn test_missing_url_is_a_bad_request() {
    let response = get(app(), "/proxy").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert!(body_json(response).await["error"].is_string());
}

#[tokio::test]
async fn test_relative_url_is_a_bad_request() {
    let response = get(app(), "/proxy?url=chunk1.ts").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_hls_manifest_is_rewritten() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/path/live.m3u8"))
        .and(header_matcher("user-agent", "VLC/3.0"))
        .and(header_matcher("referer", "https://site.example/watch"))
        .and(header_matcher("origin", "https://site.example"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/plain")
                .set_body_string("#EXTM3U\n#EXTINF:4.0,\nchunk1.ts\n"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let target = format!("{}/path/live.m3u8", server.uri());
    let uri = format!(
        "{}&ua=VLC%2F3.0&referer={}",
        proxy_uri("/proxy", &target),
        urlencoding::encode("https://site.example/watch")
    );
    let response = get(app(), &uri).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/vnd.apple.mpegurl"
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

    let expected_segment = format!(
        "https://relay.example/proxy?url={}&ua=VLC%2F3.0&referer={}",
        urlencoding::encode(&format!("{}/path/chunk1.ts", server.uri())),
        urlencoding::encode("https://site.example/watch")
    );
    assert_eq!(
        body_text(response).await,
        format!("#EXTM3U\n#EXTINF:4.0,\n{}\n", expected_segment)
    );
}

#[tokio::test]
async fn test_manifest_rewrite_uses_the_post_redirect_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/entry.m3u8"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/edge/7/index.m3u8"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/edge/7/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U\nseg.ts"))
        .mount(&server)
        .await;

    let response = get(
        app(),
        &proxy_uri("/proxy", &format!("{}/entry.m3u8", server.uri())),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;
    assert!(body.ends_with(&urlencoding::encode(&format!("{}/edge/7/seg.ts", server.uri())).into_owned()));
}

#[tokio::test]
async fn test_gzip_is_sent_when_asked_for() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U\nseg.ts\n"))
        .mount(&server)
        .await;

    let response = app()
        .oneshot(
            Request::builder()
                .uri(proxy_uri("/proxy", &format!("{}/live.m3u8", server.uri())))
                .header(header::ACCEPT_ENCODING, "gzip, deflate")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
}

#[tokio::test]
async fn test_upstream_status_is_mirrored() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone.m3u8"))
        .respond_with(ResponseTemplate::new(404).set_body_string("<html>not here</html>"))
        .mount(&server)
        .await;

    let response = get(
        app(),
        &proxy_uri("/proxy", &format!("{}/gone.m3u8", server.uri())),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(body_json(response).await["error"], "upstream returned 404");
}

#[tokio::test]
async fn test_redirect_without_location_is_a_bad_gateway() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cached.m3u8"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let response = get(
        app(),
        &proxy_uri("/proxy", &format!("{}/cached.m3u8", server.uri())),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert!(body_json(response).await["error"].is_string());
}

#[tokio::test]
async fn test_dash_manifest_detected_by_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dash/stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/dash+xml")
                .set_body_string(
                    r#"<MPD><Period><SegmentTemplate media="chunk-$Number$.m4s" initialization="init.mp4"/></Period></MPD>"#,
                ),
        )
        .expect(1)
        .mount(&server)
        .await;

    let response = get(
        app(),
        &proxy_uri("/proxy", &format!("{}/dash/stream", server.uri())),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/dash+xml");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

    let expected = format!(
        r#"<MPD><Period><SegmentTemplate media="chunk-$Number$.m4s" initialization="https://relay.example/proxy?url={}"/></Period></MPD>"#,
        urlencoding::encode(&format!("{}/dash/init.mp4", server.uri()))
    );
    assert_eq!(body_text(response).await, expected);
}

#[tokio::test]
async fn test_identity_reaches_upstream_and_every_rewritten_link() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/keys/live.m3u8"))
        .and(header_matcher("user-agent", "Mozilla/5.0 (SMART-TV)"))
        .and(header_matcher("referer", "https://site.example/watch/9"))
        .and(header_matcher("origin", "https://site.example"))
        .and(header_matcher("cookie", "session=abc"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/vnd.apple.mpegurl")
                .set_body_string(
                    "\u{feff}#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n#EXTINF:4.0,\nseg1.ts\n",
                ),
        )
        .expect(1)
        .mount(&server)
        .await;

    let uri = format!(
        "{}&ua={}&referer={}&cookie={}",
        proxy_uri("/proxy", &format!("{}/keys/live.m3u8", server.uri())),
        urlencoding::encode("Mozilla/5.0 (SMART-TV)"),
        urlencoding::encode("https://site.example/watch/9"),
        urlencoding::encode("session=abc")
    );
    let response = get(app(), &uri).await;

    assert_eq!(response.status(), StatusCode::OK);

    let identity = format!(
        "&ua={}&referer={}&cookie={}",
        urlencoding::encode("Mozilla/5.0 (SMART-TV)"),
        urlencoding::encode("https://site.example/watch/9"),
        urlencoding::encode("session=abc")
    );
    let link = |file: &str| {
        format!(
            "https://relay.example/proxy?url={}{}",
            urlencoding::encode(&format!("{}/keys/{}", server.uri(), file)),
            identity
        )
    };
    assert_eq!(
        body_text(response).await,
        format!(
            "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"{}\"\n#EXTINF:4.0,\n{}\n",
            link("key.bin"),
            link("seg1.ts")
        )
    );
}

#[tokio::test]
async fn test_media_streams_through_with_range_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/seg1.ts"))
        .and(header_matcher("range", "bytes=0-3"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Type", "video/mp2t")
                .insert_header("Content-Range", "bytes 0-3/100")
                .set_body_bytes(vec![0x47, 0x00, 0x11, 0x10]),
        )
        .expect(1)
        .mount(&server)
        .await;

    // the bare root mount serves the same proxy
    let response = app()
        .oneshot(
            Request::builder()
                .uri(proxy_uri("/", &format!("{}/seg1.ts", server.uri())))
                .header(header::RANGE, "bytes=0-3")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-3/100");
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.as_ref(), &[0x47, 0x00, 0x11, 0x10]);
}

#[tokio::test]
async fn test_options_short_circuits() {
    let response = app()
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/proxy")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}

#[tokio::test]
async fn test_portal_rejects_unknown_actions() {
    let response = get(app(), "/portal?action=vod").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // no portal configured
    let response = get(app(), "/portal?action=channels").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_portal_lists_channels_with_drm_attached() {
    let mut portal = MockPortalClient::new();
    portal.expect_list_channels().returning(|| {
        Ok(ChannelListing {
            channels: vec![Channel {
                id: "42".to_string(),
                name: "Cinema".to_string(),
                logo: None,
                upstream_command: "42".to_string(),
                manifest_kind: StreamFormat::Dash,
                genre: "Movies".to_string(),
                drm: None,
                user_agent: None,
                referrer: None,
                use_proxy: true,
            }],
            genres: vec![],
        })
    });
    portal
        .expect_resolve_stream()
        .returning(|cmd| Ok(format!("http://panel.example/live/u/p/{}.m3u8", cmd)));

    let drm = InMemoryChannelDrmRepository::new().with_record(
        "42",
        DrmConfig::Widevine {
            widevine_license_url: "https://license.example/wv".to_string(),
        },
    );
    let services = services()
        .with_portal(Arc::new(portal), "xtream")
        .with_drm_repository(Arc::new(drm));
    let app = EdgeApplicationServer::router(services);

    let response = get(app.clone(), "/portal?action=channels").await;
    assert_eq!(response.status(), StatusCode::OK);
    let listing = body_json(response).await;
    assert_eq!(
        listing["channels"][0]["drm"],
        json!({ "widevine_license_url": "https://license.example/wv" })
    );
    assert_eq!(listing["channels"][0]["manifest_kind"], "dash");

    let response = get(app.clone(), "/portal?action=stream").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = get(app, "/portal?action=stream&cmd=42").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({ "url": "http://panel.example/live/u/p/42.m3u8", "manifest_kind": "hls" })
    );
}

#[tokio::test]
async fn test_reported_failures_reorder_the_proxy_list() {
    let app = app();

    let response = get(app.clone(), "/proxies").await;
    let list = body_json(response).await;
    assert_eq!(list["proxies"][0]["label"], "primary");
    assert_eq!(list["proxies"][0]["cooling_down"], false);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/proxies/failures")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({ "base_url": "https://p1.example/proxy" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["label"], "primary");

    let list = body_json(get(app.clone(), "/proxies").await).await;
    let order: Vec<ProxyCandidate> = list["proxies"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| serde_json::from_value(p.clone()).unwrap())
        .collect();
    assert_eq!(order[0].label, "backup");
    assert_eq!(order[1].label, "primary");
    assert_eq!(list["proxies"][1]["cooling_down"], true);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/proxies/failures")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "base_url": "https://nope.example" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_without_redis_is_healthy() {
    let response = get(app(), "/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    let health = body_json(response).await;
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["services"]["redis"], Value::Null);
    assert_eq!(health["services"]["proxy_candidates"], 2);

    // no recorder installed in tests
    let response = get(app(), "/metrics").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
