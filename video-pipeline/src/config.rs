use crate::types::{Channel, ChannelKind, FetchConfig, PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_DB_PATH: &str = "pipeline.db";

/// Per-stage retry budget used by the stage executor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Attempt 2 waits `2 * base_delay`, attempt 3 waits `4 * base_delay`.
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestFormat {
    #[default]
    Markdown,
    Json,
}

impl std::str::FromStr for DigestFormat {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(DigestFormat::Markdown),
            "json" => Ok(DigestFormat::Json),
            other => Err(format!("unknown digest format '{}'", other)),
        }
    }
}

/// Chat endpoints and which of them the notify stage delivers to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationTargets {
    pub enabled: Vec<ChannelKind>,
    pub discord_webhook_url: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl NotificationTargets {
    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty()
    }

    pub fn has_credentials(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Discord => self.discord_webhook_url.is_some(),
            ChannelKind::Slack => self.slack_webhook_url.is_some(),
            ChannelKind::Telegram => self.telegram_bot_token.is_some() && self.telegram_chat_id.is_some(),
        }
    }
}

pub fn parse_channel_kinds(value: &str) -> Result<Vec<ChannelKind>> {
    let mut kinds = Vec::new();
    for part in value.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        let kind: ChannelKind = part.parse().map_err(PipelineError::Config)?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: PathBuf,
    /// Empty means the built-in registry.
    pub channels: Vec<Channel>,
    pub lookback: chrono::Duration,
    pub output_path: Option<PathBuf>,
    pub digest_format: DigestFormat,
    pub notifications: NotificationTargets,
    pub retry: RetryPolicy,
    pub fetch: FetchConfig,
    pub summary_max_length: usize,
    pub key_moment_count: usize,
    pub max_concurrent_channels: usize,
    /// How long a run may hold a video before another run can take it over.
    pub claim_ttl: chrono::Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            channels: Vec::new(),
            lookback: chrono::Duration::hours(24),
            output_path: None,
            digest_format: DigestFormat::Markdown,
            notifications: NotificationTargets::default(),
            retry: RetryPolicy::default(),
            fetch: FetchConfig::default(),
            summary_max_length: 500,
            key_moment_count: 10,
            max_concurrent_channels: 1,
            claim_ttl: chrono::Duration::minutes(30),
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` but reading variables through `lookup`, so callers
    /// can supply their own environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let read = |key: &str| lookup(key).map(|value| value.trim().to_string()).filter(|value| !value.is_empty());

        if let Some(path) = read("VIDEO_PIPELINE_DB") {
            config.db_path = PathBuf::from(path);
        }

        let targets = &mut config.notifications;
        targets.discord_webhook_url = read("DISCORD_WEBHOOK_URL");
        targets.slack_webhook_url = read("SLACK_WEBHOOK_URL");
        targets.telegram_bot_token = read("TELEGRAM_BOT_TOKEN");
        targets.telegram_chat_id = read("TELEGRAM_CHAT_ID");

        if let Some(kinds) = read("VIDEO_PIPELINE_NOTIFY") {
            targets.enabled = parse_channel_kinds(&kinds)?;
        }

        for kind in &targets.enabled {
            if !targets.has_credentials(*kind) {
                warn!("Notification target {} enabled without credentials", kind);
            }
        }

        debug!("Loaded pipeline configuration (db: {})", config.db_path.display());
        Ok(config)
    }

    pub fn with_channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct ChannelEntry {
    id: String,
    name: String,
    #[serde(default)]
    feed_url: Option<String>,
}

/// Reads a JSON channel list: `[{"id": "...", "name": "...", "feed_url": "..."}]`.
pub fn load_channels_file(path: &Path) -> Result<Vec<Channel>> {
    let content = std::fs::read_to_string(path)?;
    parse_channels_json(&content)
}

pub fn parse_channels_json(content: &str) -> Result<Vec<Channel>> {
    let entries: Vec<ChannelEntry> = serde_json::from_str(content)?;

    entries
        .into_iter()
        .map(|entry| {
            if entry.id.trim().is_empty() {
                return Err(PipelineError::Config(format!("channel '{}' has an empty id", entry.name)));
            }
            let mut channel = Channel::youtube(entry.id.trim(), &entry.name);
            if let Some(feed_url) = entry.feed_url {
                url::Url::parse(&feed_url)?;
                channel.feed_url = feed_url;
            }
            Ok(channel)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overlay_reads_targets() {
        let env: HashMap<&str, &str> = [
            ("VIDEO_PIPELINE_DB", "/tmp/videos.db"),
            ("SLACK_WEBHOOK_URL", "https://hooks.slack.test/abc"),
            ("VIDEO_PIPELINE_NOTIFY", "slack, discord,slack"),
        ]
        .into_iter()
        .collect();

        let config = PipelineConfig::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/videos.db"));
        assert_eq!(config.notifications.enabled, vec![ChannelKind::Slack, ChannelKind::Discord]);
        assert!(config.notifications.has_credentials(ChannelKind::Slack));
        assert!(!config.notifications.has_credentials(ChannelKind::Discord));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.lookback, chrono::Duration::hours(24));
    }

    #[test]
    fn unknown_notify_kind_is_a_config_error() {
        let result = PipelineConfig::from_lookup(|key| {
            (key == "VIDEO_PIPELINE_NOTIFY").then(|| "pager".to_string())
        });
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn channels_json_defaults_feed_url() {
        let channels = parse_channels_json(
            r#"[{"id": "UC123", "name": "Test"}, {"id": "UC456", "name": "Other", "feed_url": "http://localhost/feed.xml"}]"#,
        )
        .unwrap();

        assert_eq!(channels[0].feed_url, "https://www.youtube.com/feeds/videos.xml?channel_id=UC123");
        assert_eq!(channels[1].feed_url, "http://localhost/feed.xml");
        assert!(parse_channels_json(r#"[{"id": " ", "name": "Blank"}]"#).is_err());
    }
}
