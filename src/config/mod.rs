//! Configuration management for herald
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files. The resulting [`Config`] is built once at startup
//! and the relevant section handed to each component constructor.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::channels::{TelegramConfig, WebhookConfig};
use crate::media::MediaPolicy;
use crate::pipeline::OrchestratorConfig;
use crate::scheduler::{parse_slots, parse_utc_offset, PublicationMode, ScheduleSettings};
use crate::storage::{DedupConfig, LockConfig, StoreConfig};
use crate::supervisor::SessionConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Feeds polled for candidates
    pub feeds: FeedsConfig,

    /// Emission cadence
    pub publication: PublicationConfig,

    /// State persistence and dedup history
    pub state: StateConfig,

    /// Session, task and cleanup maintenance
    pub supervisor: SupervisorConfig,

    /// Image acquisition
    pub media: MediaConfig,

    /// Content rewriting
    pub enhancer: EnhancerConfig,

    /// Downstream channel
    pub channel: ChannelConfig,

    /// Length limits
    pub content: ContentConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

// ============================================================================
// Sections
// ============================================================================

/// One configured feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub url: String,

    /// Source tag; the feed's own title when absent
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_true")]
    pub active: bool,
}

impl FeedEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            active: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedsConfig {
    pub urls: Vec<FeedEntry>,

    /// Pause between consecutive feed requests in seconds
    pub request_delay_secs: u64,
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            request_delay_secs: 5,
        }
    }
}

/// Publication cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicationConfig {
    pub mode: PublicationMode,

    /// Minimum gap between emissions in pacing mode, seconds
    pub min_interval_secs: u64,

    /// Comma-separated daily slots (`H:MM` or `H:MM:SS`)
    pub schedule: String,

    /// Offset the slots are expressed in, e.g. `+03:00`
    pub utc_offset: String,

    pub max_posts_per_cycle: usize,

    /// Pause between cycles, seconds
    pub check_interval_secs: u64,
}

impl Default for PublicationConfig {
    fn default() -> Self {
        Self {
            mode: PublicationMode::Pacing,
            min_interval_secs: 300,
            schedule: "09:00,12:00,18:00".to_string(),
            utc_offset: "+00:00".to_string(),
            max_posts_per_cycle: 5,
            check_interval_secs: 300,
        }
    }
}

impl PublicationConfig {
    /// Scheduler settings; an unusable offset falls back to UTC
    pub fn schedule_settings(&self) -> ScheduleSettings {
        let utc_offset = match parse_utc_offset(&self.utc_offset) {
            Ok(offset) => offset,
            Err(e) => {
                tracing::warn!(offset = %self.utc_offset, error = %e, "Invalid UTC offset, using UTC");
                ScheduleSettings::default().utc_offset
            }
        };
        ScheduleSettings {
            mode: self.mode,
            min_interval: Duration::from_secs(self.min_interval_secs.max(1)),
            slots: parse_slots(&self.schedule),
            utc_offset,
        }
    }

    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// State persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub path: PathBuf,

    /// Defaults to `state_backups` next to the state file
    pub backup_dir: Option<PathBuf>,

    /// Dedup history kept after eviction
    pub max_entries: usize,

    pub max_backups: usize,

    pub lock_timeout_secs: u64,

    /// Periodic flush, seconds
    pub save_interval_secs: u64,

    pub reject_duplicate_content: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/state.json"),
            backup_dir: None,
            max_entries: 1000,
            max_backups: 10,
            lock_timeout_secs: 60,
            save_interval_secs: 300,
            reject_duplicate_content: true,
        }
    }
}

impl StateConfig {
    pub fn store_config(&self) -> StoreConfig {
        let timeout = Duration::from_secs(self.lock_timeout_secs);
        let mut config = StoreConfig::new(&self.path)
            .with_max_backups(self.max_backups)
            .with_lock(LockConfig {
                timeout,
                stale_after: timeout,
                ..LockConfig::default()
            });
        if let Some(dir) = &self.backup_dir {
            config = config.with_backup_dir(dir);
        }
        config
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig::default()
            .with_max_entries(self.max_entries)
            .with_content_rejection(self.reject_duplicate_content)
    }

    #[must_use]
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }
}

/// Resource lifecycle maintenance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub session_refresh_secs: u64,
    pub session_retry_secs: u64,
    pub task_monitor_secs: u64,
    pub max_tasks: usize,
    pub cleanup_interval_secs: u64,
    pub artifact_retention_secs: u64,

    /// Whole-request timeout for the shared session
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,

    /// Grace period for loops to stop on shutdown
    pub shutdown_grace_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            session_refresh_secs: 3600,
            session_retry_secs: 300,
            task_monitor_secs: 300,
            max_tasks: 500,
            cleanup_interval_secs: 43_200,
            artifact_retention_secs: 86_400,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            user_agent: format!("herald/{}", env!("CARGO_PKG_VERSION")),
            shutdown_grace_secs: 10,
        }
    }
}

impl SupervisorConfig {
    #[must_use]
    pub fn session_refresh(&self) -> Duration {
        Duration::from_secs(self.session_refresh_secs)
    }

    #[must_use]
    pub fn session_retry(&self) -> Duration {
        Duration::from_secs(self.session_retry_secs)
    }

    #[must_use]
    pub fn task_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.task_monitor_secs)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    #[must_use]
    pub fn artifact_retention(&self) -> Duration {
        Duration::from_secs(self.artifact_retention_secs)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timeout: Duration::from_secs(self.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            user_agent: self.user_agent.clone(),
        }
    }
}

/// Image acquisition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub policy: MediaPolicy,
    pub output_dir: PathBuf,
    pub download_timeout_secs: u64,

    /// Keep images after emission instead of deleting them
    pub keep_files: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            policy: MediaPolicy::BestEffort,
            output_dir: PathBuf::from("data/media"),
            download_timeout_secs: 30,
            keep_files: false,
        }
    }
}

impl MediaConfig {
    #[must_use]
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Ollama-compatible rewriting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancerConfig {
    pub enabled: bool,

    /// Ollama endpoint URL
    pub endpoint: String,

    pub model: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Temperature for generation (0.0 - 1.0)
    pub temperature: f32,
}

impl Default for EnhancerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:11434".to_string(),
            model: "qwen2.5:7b".to_string(),
            timeout_secs: 60,
            max_tokens: 2048,
            temperature: 0.1,
        }
    }
}

/// Which channel receives publications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Telegram,
    Webhook,
    /// Dry run
    #[default]
    Log,
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telegram" => Ok(Self::Telegram),
            "webhook" => Ok(Self::Webhook),
            "log" | "dry_run" | "dry-run" => Ok(Self::Log),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Telegram => "telegram",
            Self::Webhook => "webhook",
            Self::Log => "log",
        })
    }
}

/// Channel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub telegram: TelegramConfig,
    pub webhook: WebhookConfig,
}

/// Length limits applied before emission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    pub min_title_length: usize,
    pub max_title_length: usize,
    pub max_description_length: usize,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            min_title_length: 5,
            max_title_length: 1500,
            max_description_length: 10_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key = key, value = %raw, "Unparseable environment value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_list(key: &str) -> Vec<String> {
    env_string(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Unset or unparseable variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let urls = env_list("HERALD_FEEDS");
        let mut active = env_list("HERALD_FEEDS_ACTIVE");
        if !active.is_empty() && active.len() != urls.len() {
            tracing::warn!(
                feeds = urls.len(),
                flags = active.len(),
                "HERALD_FEEDS_ACTIVE length mismatch, enabling all feeds"
            );
            active.clear();
        }
        let feeds = urls
            .into_iter()
            .enumerate()
            .map(|(i, url)| FeedEntry {
                active: active.get(i).map_or(true, |flag| flag.parse().unwrap_or(true)),
                ..FeedEntry::new(url)
            })
            .collect();

        let publication = PublicationConfig {
            mode: env_or("HERALD_PUBLICATION_MODE", defaults.publication.mode),
            min_interval_secs: env_or("HERALD_MIN_INTERVAL", defaults.publication.min_interval_secs),
            schedule: env_string("HERALD_SCHEDULE").unwrap_or(defaults.publication.schedule),
            utc_offset: env_string("HERALD_UTC_OFFSET").unwrap_or(defaults.publication.utc_offset),
            max_posts_per_cycle: env_or(
                "HERALD_MAX_POSTS_PER_CYCLE",
                defaults.publication.max_posts_per_cycle,
            ),
            check_interval_secs: env_or("HERALD_CHECK_INTERVAL", defaults.publication.check_interval_secs),
        };

        let state = StateConfig {
            path: env_string("HERALD_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.state.path),
            backup_dir: env_string("HERALD_BACKUP_DIR").map(PathBuf::from),
            max_entries: env_or("HERALD_MAX_ENTRIES", defaults.state.max_entries),
            ..defaults.state
        };

        let media = MediaConfig {
            policy: env_or("HERALD_MEDIA_POLICY", defaults.media.policy),
            output_dir: env_string("HERALD_MEDIA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.media.output_dir),
            ..defaults.media
        };

        let enhancer = EnhancerConfig {
            enabled: env_or("HERALD_ENHANCER_ENABLED", defaults.enhancer.enabled),
            endpoint: env_string("OLLAMA_ENDPOINT").unwrap_or(defaults.enhancer.endpoint),
            model: env_string("OLLAMA_MODEL").unwrap_or(defaults.enhancer.model),
            timeout_secs: env_or("OLLAMA_TIMEOUT", defaults.enhancer.timeout_secs),
            ..defaults.enhancer
        };

        let mut channel = ChannelConfig {
            kind: env_or("HERALD_CHANNEL", defaults.channel.kind),
            ..defaults.channel
        };
        if let Some(token) = env_string("TELEGRAM_TOKEN") {
            channel.telegram.bot_token = token;
        }
        if let Some(chat_id) = env_string("TELEGRAM_CHAT_ID") {
            channel.telegram.chat_id = chat_id;
        }
        if let Some(url) = env_string("HERALD_WEBHOOK_URL") {
            channel.webhook.url = url;
        }
        channel.webhook.auth_token = env_string("HERALD_WEBHOOK_TOKEN");

        let logging = LoggingConfig {
            level: env_string("HERALD_LOG_LEVEL").unwrap_or(defaults.logging.level),
            format: env_string("HERALD_LOG_FORMAT").unwrap_or(defaults.logging.format),
        };

        Ok(Self {
            feeds: FeedsConfig {
                urls: feeds,
                request_delay_secs: env_or("HERALD_FEED_REQUEST_DELAY", defaults.feeds.request_delay_secs),
            },
            publication,
            state,
            supervisor: defaults.supervisor,
            media,
            enhancer,
            channel,
            content: defaults.content,
            logging,
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// File when given, environment otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::from_env(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.publication.max_posts_per_cycle == 0 {
            anyhow::bail!("max_posts_per_cycle must be greater than 0");
        }

        if self.publication.min_interval_secs == 0 {
            anyhow::bail!("min_interval_secs must be greater than 0");
        }

        if self.publication.check_interval_secs == 0 {
            anyhow::bail!("check_interval_secs must be greater than 0");
        }

        if self.state.max_entries == 0 {
            anyhow::bail!("max_entries must be greater than 0");
        }

        if self.supervisor.max_tasks == 0 {
            anyhow::bail!("max_tasks must be greater than 0");
        }

        if self.supervisor.request_timeout_secs == 0 || self.media.download_timeout_secs == 0 {
            anyhow::bail!("timeouts must be greater than 0");
        }

        for feed in &self.feeds.urls {
            if !feed.url.starts_with("http://") && !feed.url.starts_with("https://") {
                anyhow::bail!("feed URL must start with http:// or https://: {}", feed.url);
            }
        }

        match self.channel.kind {
            ChannelKind::Telegram => self
                .channel
                .telegram
                .validate()
                .map_err(|e| anyhow::anyhow!("telegram channel: {e}"))?,
            ChannelKind::Webhook => self
                .channel
                .webhook
                .validate()
                .map_err(|e| anyhow::anyhow!("webhook channel: {e}"))?,
            ChannelKind::Log => {}
        }

        Ok(())
    }

    /// Settings for the pipeline driver
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_posts_per_cycle: self.publication.max_posts_per_cycle,
            check_interval: self.publication.check_interval(),
            save_interval: self.state.save_interval(),
            media_policy: self.media.policy,
            media_timeout: self.media.download_timeout(),
            keep_media: self.media.keep_files,
            min_title_length: self.content.min_title_length,
            max_title_length: self.content.max_title_length,
            max_description_length: self.content.max_description_length,
        }
    }

    /// Get request timeout as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor.request_timeout_secs)
    }
}
