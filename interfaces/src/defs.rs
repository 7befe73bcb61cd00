use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One caption line of a video transcript.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Seconds from the start of the video.
    pub start: f64,
    pub duration: f64,
    pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub segments: Vec<TranscriptSegment>,
}

impl Transcript {
    pub fn new(segments: Vec<TranscriptSegment>) -> Self {
        Self { segments }
    }

    /// Plain text of the whole transcript, one space between segments.
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|segment| segment.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyMoment {
    /// Seconds from the start of the video.
    pub offset: f64,
    pub label: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Discord,
    Slack,
    Telegram,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Discord => "discord",
            ChannelKind::Slack => "slack",
            ChannelKind::Telegram => "telegram",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "discord" => Ok(ChannelKind::Discord),
            "slack" => Ok(ChannelKind::Slack),
            "telegram" => Ok(ChannelKind::Telegram),
            other => Err(format!("unknown notification channel '{}'", other)),
        }
    }
}

/// What gets delivered to a chat platform for one finished video.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub video_id: String,
    pub title: String,
    pub body: String,
    pub url: String,
    pub channel_name: String,
    pub thumbnail: Option<String>,
}

/// Coarse classification driving the retry decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network, timeout or rate limit. Worth another attempt.
    Transient,
    /// The content itself cannot be processed (no transcript, restricted, policy).
    PermanentContent,
    /// Missing or rejected credentials, unknown endpoint configuration.
    Configuration,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::PermanentContent => "permanent_content",
            FailureKind::Configuration => "configuration",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CapabilityError {
    #[error("Not available: {0}")]
    NotAvailable(String),

    #[error("Restricted: {0}")]
    Restricted(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Content policy rejection: {0}")]
    ContentPolicy(String),

    #[error("Authorization failed: {0}")]
    Auth(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CapabilityError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CapabilityError::Transient(_) => FailureKind::Transient,
            CapabilityError::NotAvailable(_)
            | CapabilityError::Restricted(_)
            | CapabilityError::ContentPolicy(_)
            | CapabilityError::InvalidInput(_) => FailureKind::PermanentContent,
            CapabilityError::Auth(_) | CapabilityError::Configuration(_) => FailureKind::Configuration,
        }
    }
}

pub type CapabilityResult<T> = Result<T, CapabilityError>;

#[async_trait]
pub trait TranscriptSource: Send + Sync {
    async fn fetch_transcript(&self, video_id: &str) -> CapabilityResult<Transcript>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str, max_length: usize) -> CapabilityResult<String>;
}

#[async_trait]
pub trait KeyMomentExtractor: Send + Sync {
    /// Moments come back ordered by offset.
    async fn extract_key_moments(&self, transcript: &Transcript, count: usize) -> CapabilityResult<Vec<KeyMoment>>;
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch_notification(&self, channel_kind: ChannelKind, payload: &NotificationPayload) -> CapabilityResult<()>;
}

// Object style note:
// Implementations are called once per video per stage attempt and must not
// retry on their own; the pipeline owns the retry budget and the timeout.
// Keep them stateless where possible so a single instance can be shared
// across concurrently processed channels.
