//! Collaborator integration tests
//!
//! Each external seam against a mocked HTTP server:
//! 1. Telegram Bot API (text, photo, caption overflow, refusals)
//! 2. Webhook delivery and retry
//! 3. Ollama-compatible enhancer
//! 4. Image downloads
//! 5. Multi-feed retrieval

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use herald::channels::{ChannelError, Emitter, TelegramChannel, TelegramConfig, WebhookChannel, WebhookConfig};
use herald::config::{EnhancerConfig, FeedEntry};
use herald::enhance::{EnhanceOutcome, Enhancer, LlmEnhancer};
use herald::feed::{FeedSource, RssFeedSource};
use herald::media::{ImageDownloader, MediaSource};
use herald::utils::error::FetchError;
use herald::utils::retry::RetryConfig;
use herald::{CandidateItem, Publication};

use super::fixtures::{image_bytes, SAMPLE_RSS, SAMPLE_RSS_NEXT};
use crate::common::test_session;

const TOKEN: &str = "123:abc";

fn publication(image_path: Option<PathBuf>) -> Publication {
    Publication {
        fingerprint: "f00dfeed".to_string(),
        title: "Rates & bonds".to_string(),
        description: "Markets closed higher.".to_string(),
        link: "https://news.example.com/markets/1".to_string(),
        image_path,
        source: Some("Example Wire".to_string()),
    }
}

fn telegram(server: &MockServer) -> TelegramChannel {
    TelegramChannel::new(
        TelegramConfig::new(TOKEN, "@herald_test").with_api_base(server.uri()),
        test_session(),
    )
    .unwrap()
    .with_retry(RetryConfig::none())
}

fn telegram_ok(message_id: u64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "ok": true,
        "result": {"message_id": message_id}
    }))
}

async fn bodies(server: &MockServer, endpoint: &str) -> Vec<Vec<u8>> {
    server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == endpoint)
        .map(|r| r.body)
        .collect()
}

fn contains(haystack: &[u8], needle: &str) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle.as_bytes())
}

// ============================================================================
// Telegram
// ============================================================================

#[tokio::test]
async fn test_telegram_text_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/sendMessage")))
        .and(body_partial_json(serde_json::json!({
            "chat_id": "@herald_test",
            "parse_mode": "HTML",
            "text": "<b>Rates &amp; bonds</b>\n\nMarkets closed higher.\n\n<a href='https://news.example.com/markets/1'>Read more</a>"
        })))
        .respond_with(telegram_ok(42))
        .expect(1)
        .mount(&server)
        .await;

    let status = telegram(&server).emit(&publication(None)).await.unwrap();

    assert!(status.success);
    assert_eq!(status.channel, "telegram");
    assert_eq!(status.remote_id.as_deref(), Some("42"));
}

#[tokio::test]
async fn test_telegram_photo_with_caption() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("f00dfeed_0a1b2c3d.jpg");
    std::fs::write(&image, image_bytes()).unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/sendPhoto")))
        .respond_with(telegram_ok(7))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/sendMessage")))
        .respond_with(telegram_ok(8))
        .expect(0)
        .mount(&server)
        .await;

    let status = telegram(&server).emit(&publication(Some(image))).await.unwrap();
    assert_eq!(status.remote_id.as_deref(), Some("7"));

    let sent = bodies(&server, &format!("/bot{TOKEN}/sendPhoto")).await;
    assert!(contains(&sent[0], "name=\"caption\""));
    assert!(contains(&sent[0], "filename=\"f00dfeed_0a1b2c3d.jpg\""));
    assert!(contains(&sent[0], "Markets closed higher."));
}

#[tokio::test]
async fn test_telegram_long_caption_falls_back_to_separate_message() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("f00dfeed_0a1b2c3d.png");
    std::fs::write(&image, image_bytes()).unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/sendPhoto")))
        .respond_with(telegram_ok(10))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/sendMessage")))
        .respond_with(telegram_ok(11))
        .expect(1)
        .mount(&server)
        .await;

    let mut long = publication(Some(image));
    long.description = "word ".repeat(400);

    let status = telegram(&server).emit(&long).await.unwrap();
    assert_eq!(status.remote_id.as_deref(), Some("11"));

    let photo = bodies(&server, &format!("/bot{TOKEN}/sendPhoto")).await;
    assert!(!contains(&photo[0], "name=\"caption\""));
    assert!(contains(&photo[0], "image/png"));
}

#[tokio::test]
async fn test_telegram_missing_image_sends_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/sendMessage")))
        .respond_with(telegram_ok(3))
        .expect(1)
        .mount(&server)
        .await;

    let gone = PathBuf::from("/nonexistent/herald/image.jpg");
    let status = telegram(&server).emit(&publication(Some(gone))).await.unwrap();
    assert!(status.success);
}

#[tokio::test]
async fn test_telegram_refusal_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/sendMessage")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": false,
            "description": "Bad Request: chat not found"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let channel = telegram(&server).with_retry(RetryConfig::with_delays(3, 1, 5));
    let err = channel.emit(&publication(None)).await.unwrap_err();

    match err {
        ChannelError::Rejected { body, .. } => assert!(body.contains("chat not found")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_telegram_health_check() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/getMe")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "result": {"id": 123, "is_bot": true, "username": "herald_bot"}
        })))
        .mount(&server)
        .await;

    assert!(telegram(&server).health_check().await.unwrap());

    let offline = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
        .mount(&offline)
        .await;
    assert!(!telegram(&offline).health_check().await.unwrap());
}

// ============================================================================
// Webhook
// ============================================================================

#[tokio::test]
async fn test_webhook_sends_headers_and_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("authorization", "Bearer s3cret"))
        .and(header("x-herald-source", "integration"))
        .and(body_partial_json(serde_json::json!({
            "fingerprint": "f00dfeed",
            "title": "Rates & bonds",
            "image": "f00dfeed_0a1b2c3d.jpg",
            "source": "Example Wire"
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let channel = WebhookChannel::new(
        WebhookConfig::new(format!("{}/hook", server.uri()))
            .with_auth_token("s3cret")
            .with_header("X-Herald-Source", "integration"),
        test_session(),
    )
    .unwrap();

    let image = PathBuf::from("/var/media/f00dfeed_0a1b2c3d.jpg");
    let status = channel.emit(&publication(Some(image))).await.unwrap();
    assert!(status.success);
    assert_eq!(status.channel, "webhook");
}

#[tokio::test]
async fn test_webhook_retries_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let channel = WebhookChannel::new(WebhookConfig::new(format!("{}/hook", server.uri())), test_session())
        .unwrap()
        .with_retry(RetryConfig::with_delays(3, 5, 20));

    assert!(channel.emit(&publication(None)).await.unwrap().success);
}

#[tokio::test]
async fn test_webhook_gives_up_after_max_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .expect(3)
        .mount(&server)
        .await;

    let channel = WebhookChannel::new(WebhookConfig::new(format!("{}/hook", server.uri())), test_session())
        .unwrap()
        .with_retry(RetryConfig::with_delays(2, 5, 20));

    let err = channel.emit(&publication(None)).await.unwrap_err();
    assert!(matches!(err, ChannelError::Unavailable(_)));
}

// ============================================================================
// Enhancer
// ============================================================================

fn enhancer(server: &MockServer) -> LlmEnhancer {
    LlmEnhancer::new(
        EnhancerConfig {
            enabled: true,
            endpoint: server.uri(),
            timeout_secs: 5,
            ..EnhancerConfig::default()
        },
        test_session(),
    )
}

fn generate_reply(answer: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "model": "qwen2.5:7b",
        "response": answer,
        "done": true
    }))
}

#[tokio::test]
async fn test_enhancer_rewrites_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(serde_json::json!({"model": "qwen2.5:7b", "stream": false})))
        .respond_with(generate_reply(
            "```json\n{\"title\": \"Rates unchanged\", \"description\": \"The bank kept rates <b>flat</b>.\"}\n```",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = enhancer(&server)
        .enhance("Central bank holds rates steady", "Long original text")
        .await;

    assert_eq!(
        outcome,
        EnhanceOutcome::Enhanced {
            title: "Rates unchanged".to_string(),
            description: "The bank kept rates flat.".to_string(),
        }
    );
}

#[tokio::test]
async fn test_enhancer_skip_is_a_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(generate_reply(r#"{"skip": true, "reason": "advertising"}"#))
        .mount(&server)
        .await;

    let outcome = enhancer(&server).enhance("Buy now", "50% off").await;
    assert_eq!(
        outcome,
        EnhanceOutcome::Rejected {
            reason: "advertising".to_string()
        }
    );
}

#[tokio::test]
async fn test_enhancer_server_error_is_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
        .mount(&server)
        .await;

    let outcome = enhancer(&server).enhance("Title here", "Body").await;
    assert_eq!(outcome.kind(), "failed");
}

// ============================================================================
// Media
// ============================================================================

fn downloader(dir: &TempDir) -> ImageDownloader {
    ImageDownloader::new(test_session(), dir.path().join("media"), std::time::Duration::from_secs(5))
}

#[tokio::test]
async fn test_image_download_resolves_relative_url() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/img/photo.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/png")
                .set_body_bytes(image_bytes()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let item = CandidateItem::new(format!("{}/news/story-1", server.uri()), "Story title", "Body")
        .with_image("/img/photo.png");
    let stored = downloader(&dir)
        .acquire_image(&item, "0123456789abcdef0123")
        .await
        .unwrap()
        .expect("image stored");

    assert!(stored.starts_with(dir.path().join("media")));
    assert_eq!(stored.extension().and_then(|e| e.to_str()), Some("png"));
    assert_eq!(std::fs::read(&stored).unwrap().len(), image_bytes().len());
}

#[tokio::test]
async fn test_image_download_rejects_non_images() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/img/page.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string("<html>not an image</html>"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/img/tiny.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/jpeg")
                .set_body_bytes(vec![0xFF; 100]),
        )
        .mount(&server)
        .await;

    let media = downloader(&dir);
    let link = format!("{}/news/story-2", server.uri());

    let html = CandidateItem::new(&link, "Story title", "Body").with_image(format!("{}/img/page.jpg", server.uri()));
    assert!(matches!(
        media.acquire_image(&html, "fp").await,
        Err(FetchError::Rejected(_))
    ));

    let tiny = CandidateItem::new(&link, "Story title", "Body").with_image(format!("{}/img/tiny.jpg", server.uri()));
    assert!(matches!(
        media.acquire_image(&tiny, "fp").await,
        Err(FetchError::Rejected(_))
    ));

    let none = CandidateItem::new(&link, "Story title", "Body");
    assert_eq!(media.acquire_image(&none, "fp").await.unwrap(), None);
}

// ============================================================================
// Feeds
// ============================================================================

async fn mount_feed(server: &MockServer, route: &str, status: u16, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(status)
                .insert_header("content-type", "application/rss+xml")
                .set_body_string(body),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_feed_partial_failure_keeps_healthy_feeds() {
    let server = MockServer::start().await;
    mount_feed(&server, "/rss/down", 502, "bad gateway").await;
    mount_feed(&server, "/rss/up", 200, SAMPLE_RSS_NEXT).await;

    let source = RssFeedSource::new(
        test_session(),
        vec![
            FeedEntry::new(format!("{}/rss/down", server.uri())),
            FeedEntry::new(format!("{}/rss/up", server.uri())),
        ],
    );

    let items = source.fetch_candidates().await.unwrap();
    let links: Vec<_> = items.iter().map(|i| i.link.as_str()).collect();
    assert_eq!(
        links,
        vec!["https://wire.example.com/a/1002", "https://wire.example.com/a/1003"]
    );
    assert_eq!(items[0].source.as_deref(), Some("Example Wire"));
}

#[tokio::test]
async fn test_feed_all_sources_failing_is_an_error() {
    let server = MockServer::start().await;
    mount_feed(&server, "/rss/a", 500, "oops").await;
    mount_feed(&server, "/rss/b", 200, "this is not xml").await;

    let source = RssFeedSource::new(
        test_session(),
        vec![
            FeedEntry::new(format!("{}/rss/a", server.uri())),
            FeedEntry::new(format!("{}/rss/b", server.uri())),
        ],
    );

    assert!(matches!(
        source.fetch_candidates().await,
        Err(FetchError::AllSourcesFailed(2))
    ));
}

#[tokio::test]
async fn test_feed_toggle_skips_inactive_feeds() {
    let server = MockServer::start().await;
    mount_feed(&server, "/rss/first", 200, SAMPLE_RSS).await;
    mount_feed(&server, "/rss/second", 200, SAMPLE_RSS_NEXT).await;

    let first = format!("{}/rss/first", server.uri());
    let second = format!("{}/rss/second", server.uri());
    let source = Arc::new(RssFeedSource::new(
        test_session(),
        vec![
            FeedEntry::new(&first),
            FeedEntry {
                name: Some("Second Wire".to_string()),
                ..FeedEntry::new(&second)
            },
        ],
    ));

    assert_eq!(source.fetch_candidates().await.unwrap().len(), 4);

    assert!(source.set_active(&first, false).await);
    assert!(!source.set_active("https://unknown.example.com/rss", false).await);

    let items = source.fetch_candidates().await.unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i.source.as_deref() == Some("Second Wire")));
}
