//! Feed retrieval
//!
//! [`FeedSource`] is the seam the orchestrator pulls candidates through.
//! [`RssFeedSource`] fetches every active RSS/Atom feed through the shared
//! session and maps entries with `feed-rs`.

use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::FeedEntry;
use crate::pipeline::CandidateItem;
use crate::supervisor::SessionHandle;
use crate::utils::error::FetchError;
use crate::utils::{html_to_text, normalize_whitespace};

/// Produces candidate items for one cycle
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Fetch all currently offered items, in feed order
    async fn fetch_candidates(&self) -> Result<Vec<CandidateItem>, FetchError>;
}

/// Fixed list of items, for dry runs and tests
#[derive(Debug, Clone, Default)]
pub struct StaticFeed {
    items: Vec<CandidateItem>,
}

impl StaticFeed {
    pub fn new(items: Vec<CandidateItem>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl FeedSource for StaticFeed {
    async fn fetch_candidates(&self) -> Result<Vec<CandidateItem>, FetchError> {
        Ok(self.items.clone())
    }
}

/// RSS/Atom feeds fetched over HTTP
pub struct RssFeedSource {
    session: Arc<SessionHandle>,
    feeds: RwLock<Vec<FeedEntry>>,
    request_delay: Duration,
}

impl RssFeedSource {
    pub fn new(session: Arc<SessionHandle>, feeds: Vec<FeedEntry>) -> Self {
        Self {
            session,
            feeds: RwLock::new(feeds),
            request_delay: Duration::ZERO,
        }
    }

    /// Pause between consecutive feed requests
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// Enable or disable a feed by URL; returns false when the URL is unknown
    pub async fn set_active(&self, url: &str, active: bool) -> bool {
        let mut feeds = self.feeds.write().await;
        match feeds.iter_mut().find(|f| f.url == url) {
            Some(feed) => {
                feed.active = active;
                tracing::info!(url = %url, active = active, "Feed toggled");
                true
            }
            None => false,
        }
    }

    /// Snapshot of the configured feeds
    pub async fn feeds(&self) -> Vec<FeedEntry> {
        self.feeds.read().await.clone()
    }

    async fn fetch_one(&self, feed: &FeedEntry) -> Result<Vec<CandidateItem>, FetchError> {
        let lease = self.session.acquire().await?;
        let response = match lease.client.get(&feed.url).send().await {
            Ok(response) => response,
            Err(e) => {
                let err = FetchError::from_request(e);
                if err.is_connection_failure() {
                    self.session.invalidate(lease.generation).await;
                }
                return Err(err);
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: feed.url.clone(),
            });
        }

        let body = response.bytes().await.map_err(FetchError::from_request)?;
        parse_feed(&body, feed.name.as_deref())
    }
}

#[async_trait]
impl FeedSource for RssFeedSource {
    async fn fetch_candidates(&self) -> Result<Vec<CandidateItem>, FetchError> {
        let feeds: Vec<FeedEntry> = self
            .feeds
            .read()
            .await
            .iter()
            .filter(|f| f.active)
            .cloned()
            .collect();

        let mut items = Vec::new();
        let mut failed = 0usize;

        for (i, feed) in feeds.iter().enumerate() {
            if i > 0 && !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }

            match self.fetch_one(feed).await {
                Ok(mut fetched) => {
                    tracing::debug!(url = %feed.url, items = fetched.len(), "Feed fetched");
                    items.append(&mut fetched);
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(url = %feed.url, error = %e, "Feed fetch failed");
                }
            }
        }

        if !feeds.is_empty() && failed == feeds.len() {
            return Err(FetchError::AllSourcesFailed(failed));
        }

        Ok(items)
    }
}

/// Map one RSS/Atom document to candidates
///
/// `source` overrides the feed's own title as the source tag.
pub fn parse_feed(body: &[u8], source: Option<&str>) -> Result<Vec<CandidateItem>, FetchError> {
    let feed = feed_rs::parser::parse(body).map_err(|e| FetchError::Decode(e.to_string()))?;

    let source = source
        .map(str::to_string)
        .or_else(|| feed.title.as_ref().map(|t| html_to_text(&t.content)))
        .filter(|s| !s.is_empty());

    let items = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let link = entry.links.first().map(|l| l.href.trim().to_string())?;
            let title = entry
                .title
                .as_ref()
                .map(|t| normalize_whitespace(&html_escape::decode_html_entities(&t.content)))
                .unwrap_or_default();
            let summary = entry.summary.as_ref().map(|s| s.content.as_str());
            let body = entry.content.as_ref().and_then(|c| c.body.as_deref());
            let description = summary
                .or(body)
                .map(html_to_text)
                .unwrap_or_default();

            let image = entry_image(&entry).or_else(|| {
                summary
                    .and_then(first_content_image)
                    .or_else(|| body.and_then(first_content_image))
            });

            let mut item = CandidateItem::new(link, title, description);
            if let Some(url) = image {
                item = item.with_image(url);
            }
            if let Some(source) = &source {
                item = item.with_source(source.clone());
            }
            Some(item)
        })
        .filter(CandidateItem::has_link)
        .collect();

    Ok(items)
}

fn entry_image(entry: &feed_rs::model::Entry) -> Option<String> {
    let from_media = entry.media.iter().find_map(|media| {
        media
            .content
            .iter()
            .find(|c| {
                c.content_type
                    .as_ref()
                    .map_or(true, |t| t.to_string().starts_with("image/"))
            })
            .and_then(|c| c.url.as_ref().map(|u| u.to_string()))
            .or_else(|| media.thumbnails.first().map(|t| t.image.uri.clone()))
    });

    from_media.or_else(|| {
        entry
            .links
            .iter()
            .find(|l| {
                l.media_type
                    .as_deref()
                    .is_some_and(|t| t.starts_with("image/"))
            })
            .map(|l| l.href.clone())
    })
}

/// First content `<img src>` in an HTML fragment
///
/// Tracking pixels, icons, logos, spacers and ad images are passed over.
/// The source is returned as written; callers resolve it against the item
/// link.
pub fn first_content_image(html: &str) -> Option<String> {
    static IMG_RE: OnceLock<Option<Regex>> = OnceLock::new();
    static NOISE_RE: OnceLock<Option<Regex>> = OnceLock::new();

    let img = IMG_RE
        .get_or_init(|| {
            Regex::new(r#"(?is)<img\b[^>]*?\bsrc\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#).ok()
        })
        .as_ref()?;
    let noise = NOISE_RE
        .get_or_init(|| {
            Regex::new(r"(?i)pixel|icon|logo|spacer|(?:^|[/_.\-])ads?(?:[/_.\-]|$)").ok()
        })
        .as_ref();

    img.captures_iter(html).find_map(|caps| {
        let raw = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3))?;
        let src = html_escape::decode_html_entities(raw.as_str().trim()).to_string();
        if src.is_empty() || src.starts_with("data:") {
            return None;
        }
        if noise.is_some_and(|re| re.is_match(&src)) {
            return None;
        }
        Some(src)
    })
}
