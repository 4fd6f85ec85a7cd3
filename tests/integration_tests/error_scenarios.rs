//! Error scenario integration tests
//!
//! Tests various failure modes and error handling:
//! 1. Feed timeouts and refused connections
//! 2. All feeds down
//! 3. Corrupt state at startup
//! 4. Channel refusals and cross-cycle retry
//! 5. Enhancer and media failures

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use herald::channels::{WebhookChannel, WebhookConfig};
use herald::config::{EnhancerConfig, FeedEntry};
use herald::enhance::LlmEnhancer;
use herald::feed::{FeedSource, RssFeedSource};
use herald::media::{ImageDownloader, MediaPolicy};
use herald::pipeline::{ItemOutcome, Orchestrator, OrchestratorConfig};
use herald::scheduler::{PublicationScheduler, ScheduleSettings};
use herald::storage::{shared, DedupConfig, DedupEngine, LoadSource, StateStore};
use herald::supervisor::{SessionConfig, SessionHandle, TaskRegistry};
use herald::utils::error::FetchError;
use herald::utils::retry::RetryConfig;

use super::fixtures::{
    image_bytes, rss_with_image, rss_with_inline_image, CORRUPT_STATE, SAMPLE_RSS_NEXT,
};
use crate::common::{store_in, test_session};

struct Setup {
    store: Arc<StateStore>,
    session: Arc<SessionHandle>,
    config: OrchestratorConfig,
    retry: RetryConfig,
}

impl Setup {
    fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            session: test_session(),
            config: OrchestratorConfig::default(),
            retry: RetryConfig::none(),
        }
    }

    fn orchestrator(&self, server: &MockServer, feed_path: &str) -> Orchestrator {
        let state = shared(self.store.load().state);
        let feed = RssFeedSource::new(
            Arc::clone(&self.session),
            vec![FeedEntry::new(format!("{}{feed_path}", server.uri()))],
        );
        let webhook = WebhookChannel::new(
            WebhookConfig::new(format!("{}/hook", server.uri())),
            Arc::clone(&self.session),
        )
        .unwrap()
        .with_retry(self.retry.clone());

        Orchestrator::new(
            self.config.clone(),
            Arc::new(feed),
            DedupEngine::new(state, DedupConfig::default()),
            Arc::new(PublicationScheduler::with_system_clock(ScheduleSettings::pacing(
                Duration::from_millis(10),
            ))),
            Arc::new(webhook),
            Arc::clone(&self.store),
            Arc::new(TaskRegistry::new()),
        )
    }
}

async fn mount_rss(server: &MockServer, route: &str, body: impl Into<String>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/rss+xml")
                .set_body_string(body.into()),
        )
        .mount(server)
        .await;
}

// ============================================================================
// Feed Errors
// ============================================================================

#[tokio::test]
async fn test_feed_timeout_handling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(SAMPLE_RSS_NEXT)
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let session = SessionHandle::new(SessionConfig {
        timeout: Duration::from_millis(200),
        ..SessionConfig::default()
    })
    .unwrap();
    let source = RssFeedSource::new(session, vec![FeedEntry::new(format!("{}/slow", server.uri()))]);

    let result = source.fetch_candidates().await;
    assert!(matches!(result, Err(FetchError::AllSourcesFailed(1))));
}

#[tokio::test]
async fn test_connection_refused_invalidates_session() {
    let session = test_session();
    let before = session.generation().await;
    let source = RssFeedSource::new(
        Arc::clone(&session),
        vec![FeedEntry::new("http://127.0.0.1:9/rss")],
    );

    assert!(source.fetch_candidates().await.is_err());
    assert!(session.is_closed().await);

    let lease = session.acquire().await.unwrap();
    assert_eq!(lease.generation, before + 1);
    assert!(!session.is_closed().await);
}

#[tokio::test]
async fn test_all_feeds_down_fails_cycle_and_keeps_state() {
    let dir = TempDir::new().unwrap();
    let setup = Setup::new(store_in(dir.path()));
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let orchestrator = setup.orchestrator(&server, "/rss");
    let (_tx, mut rx) = watch::channel(false);
    let err = orchestrator.run_cycle(&mut rx).await.unwrap_err();

    assert!(matches!(err, FetchError::AllSourcesFailed(1)));
    assert!(err.is_recoverable());
    assert!(!setup.store.path().exists(), "nothing to persist after a failed fetch");
}

// ============================================================================
// State Errors
// ============================================================================

#[tokio::test]
async fn test_corrupt_state_at_startup_recovers_and_publishes() {
    let dir = TempDir::new().unwrap();
    let store = store_in(dir.path());
    std::fs::write(store.path(), CORRUPT_STATE).unwrap();

    let server = MockServer::start().await;
    mount_rss(&server, "/rss", SAMPLE_RSS_NEXT).await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    assert!(matches!(store.load().source, LoadSource::Recovered { .. }));

    let setup = Setup::new(Arc::clone(&store));
    let orchestrator = setup.orchestrator(&server, "/rss");
    let (_tx, mut rx) = watch::channel(false);
    let report = orchestrator.run_cycle(&mut rx).await.unwrap();
    assert_eq!(report.published(), 2);

    // The live file is valid again and the corrupt bytes were kept aside
    let reloaded = store.load();
    assert!(matches!(reloaded.source, LoadSource::Loaded(_)));
    assert_eq!(reloaded.state.sent_entries.len(), 2);
    let backups = store.list_backups().unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(std::fs::read_to_string(&backups[0].path).unwrap(), CORRUPT_STATE);
}

// ============================================================================
// Channel Errors
// ============================================================================

#[tokio::test]
async fn test_client_error_is_not_retried_but_offered_next_cycle() {
    let dir = TempDir::new().unwrap();
    let mut setup = Setup::new(store_in(dir.path()));
    setup.retry = RetryConfig::with_delays(3, 5, 20);

    let server = MockServer::start().await;
    mount_rss(&server, "/rss", SAMPLE_RSS_NEXT).await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(422).set_body_string("unprocessable"))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let orchestrator = setup.orchestrator(&server, "/rss");
    let (_tx, mut rx) = watch::channel(false);

    let first = orchestrator.run_cycle(&mut rx).await.unwrap();
    assert_eq!(first.failed(), 2, "one attempt per item, no retries on 4xx");
    assert!(first.outcomes.iter().all(|o| matches!(
        o,
        ItemOutcome::Failed { stage: "emit", reason, .. } if reason.contains("422")
    )));

    let second = orchestrator.run_cycle(&mut rx).await.unwrap();
    assert_eq!(second.published(), 2);
    assert_eq!(orchestrator.stats().errors, 2);
}

// ============================================================================
// Enhancer and Media Errors
// ============================================================================

#[tokio::test]
async fn test_enhancer_outage_leaves_items_unrecorded() {
    let dir = TempDir::new().unwrap();
    let setup = Setup::new(store_in(dir.path()));
    let server = MockServer::start().await;
    mount_rss(&server, "/rss", SAMPLE_RSS_NEXT).await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let enhancer = LlmEnhancer::new(
        EnhancerConfig {
            enabled: true,
            endpoint: server.uri(),
            ..EnhancerConfig::default()
        },
        Arc::clone(&setup.session),
    );
    let orchestrator = setup
        .orchestrator(&server, "/rss")
        .with_enhancer(Arc::new(enhancer));
    let (_tx, mut rx) = watch::channel(false);

    let report = orchestrator.run_cycle(&mut rx).await.unwrap();
    assert!(report
        .outcomes
        .iter()
        .all(|o| matches!(o, ItemOutcome::Failed { stage: "enhance", .. })));
    orchestrator.flush().await;
    assert!(setup.store.load().state.sent_entries.is_empty());
}

#[tokio::test]
async fn test_enhancer_refusal_counts_as_skipped() {
    let dir = TempDir::new().unwrap();
    let setup = Setup::new(store_in(dir.path()));
    let server = MockServer::start().await;
    mount_rss(&server, "/rss", SAMPLE_RSS_NEXT).await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "response": "{\"skip\": true, \"reason\": \"not news\"}"
        })))
        .mount(&server)
        .await;

    let enhancer = LlmEnhancer::new(
        EnhancerConfig {
            enabled: true,
            endpoint: server.uri(),
            ..EnhancerConfig::default()
        },
        Arc::clone(&setup.session),
    );
    let orchestrator = setup
        .orchestrator(&server, "/rss")
        .with_enhancer(Arc::new(enhancer));
    let (_tx, mut rx) = watch::channel(false);

    let report = orchestrator.run_cycle(&mut rx).await.unwrap();
    assert_eq!(report.published(), 0);
    assert!(matches!(
        &report.outcomes[0],
        ItemOutcome::Rejected { reason, .. } if reason == "not news"
    ));
    assert_eq!(orchestrator.stats().posts_skipped, 2);
}

#[tokio::test]
async fn test_broken_image_under_best_effort_publishes_text() {
    let dir = TempDir::new().unwrap();
    let setup = Setup::new(store_in(dir.path()));
    let server = MockServer::start().await;
    mount_rss(&server, "/rss", rss_with_image(&server.uri())).await;
    Mock::given(method("GET"))
        .and(path("/img/1001.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let orchestrator = setup
        .orchestrator(&server, "/rss")
        .with_media(Arc::new(ImageDownloader::new(
            Arc::clone(&setup.session),
            dir.path().join("media"),
            Duration::from_secs(2),
        )));
    let (_tx, mut rx) = watch::channel(false);

    let report = orchestrator.run_cycle(&mut rx).await.unwrap();
    assert_eq!(report.published(), 2);
}

#[tokio::test]
async fn test_broken_image_under_required_policy_skips_item() {
    let dir = TempDir::new().unwrap();
    let mut setup = Setup::new(store_in(dir.path()));
    setup.config.media_policy = MediaPolicy::Required;

    let server = MockServer::start().await;
    mount_rss(&server, "/rss", rss_with_image(&server.uri())).await;
    Mock::given(method("GET"))
        .and(path("/img/1001.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/gif")
                .set_body_bytes(vec![0u8; 4096]),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let orchestrator = setup
        .orchestrator(&server, "/rss")
        .with_media(Arc::new(ImageDownloader::new(
            Arc::clone(&setup.session),
            dir.path().join("media"),
            Duration::from_secs(2),
        )));
    let (_tx, mut rx) = watch::channel(false);

    let report = orchestrator.run_cycle(&mut rx).await.unwrap();
    assert_eq!(report.published(), 0);
    assert!(report
        .outcomes
        .iter()
        .all(|o| matches!(o, ItemOutcome::Skipped { reason, .. } if reason == "no image")));
    assert_eq!(orchestrator.stats().posts_skipped, 2);
}

#[tokio::test]
async fn test_required_policy_uses_image_from_description_html() {
    let dir = TempDir::new().unwrap();
    let mut setup = Setup::new(store_in(dir.path()));
    setup.config.media_policy = MediaPolicy::Required;

    let server = MockServer::start().await;
    mount_rss(&server, "/rss", rss_with_inline_image(&server.uri())).await;
    Mock::given(method("GET"))
        .and(path("/img/1003.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/jpeg")
                .set_body_bytes(image_bytes()),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/static/icon.png"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let orchestrator = setup
        .orchestrator(&server, "/rss")
        .with_media(Arc::new(ImageDownloader::new(
            Arc::clone(&setup.session),
            dir.path().join("media"),
            Duration::from_secs(2),
        )));
    let (_tx, mut rx) = watch::channel(false);

    let report = orchestrator.run_cycle(&mut rx).await.unwrap();
    assert_eq!(report.published(), 1);
    assert!(report
        .outcomes
        .iter()
        .any(|o| matches!(o, ItemOutcome::Skipped { reason, .. } if reason == "no image")));
}
