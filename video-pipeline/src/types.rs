use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use interfaces::{
    CapabilityError, ChannelKind, FailureKind, KeyMoment, NotificationPayload, Transcript, TranscriptSegment,
};

pub const YOUTUBE_FEED_URL: &str = "https://www.youtube.com/feeds/videos.xml?channel_id=";

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    pub name: String,
    pub feed_url: String,
}

impl Channel {
    /// Channel backed by the public per-channel RSS feed.
    pub fn youtube(channel_id: &str, name: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            name: name.to_string(),
            feed_url: format!("{}{}", YOUTUBE_FEED_URL, channel_id),
        }
    }
}

/// A feed entry observed in one poll, not yet checked against history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub video_id: String,
    pub channel_id: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Transcribe,
    Summarize,
    ExtractKeyMoments,
    Notify,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Transcribe, Stage::Summarize, Stage::ExtractKeyMoments, Stage::Notify];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Transcribe => "transcribe",
            Stage::Summarize => "summarize",
            Stage::ExtractKeyMoments => "extract_key_moments",
            Stage::Notify => "notify",
        }
    }

    pub fn in_progress(&self) -> VideoStatus {
        match self {
            Stage::Transcribe => VideoStatus::Transcribing,
            Stage::Summarize => VideoStatus::Summarizing,
            Stage::ExtractKeyMoments => VideoStatus::ExtractingMoments,
            Stage::Notify => VideoStatus::Notifying,
        }
    }

    pub fn completed(&self) -> VideoStatus {
        match self {
            Stage::Transcribe => VideoStatus::Transcribed,
            Stage::Summarize => VideoStatus::Summarized,
            Stage::ExtractKeyMoments => VideoStatus::MomentsExtracted,
            Stage::Notify => VideoStatus::Done,
        }
    }

    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Transcribe => Some(Stage::Summarize),
            Stage::Summarize => Some(Stage::ExtractKeyMoments),
            Stage::ExtractKeyMoments => Some(Stage::Notify),
            Stage::Notify => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == value)
            .ok_or_else(|| PipelineError::CorruptRecord(format!("unknown stage '{}'", value)))
    }
}

/// Processing status of a video. `Done` and `Failed` are terminal for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoStatus {
    Discovered,
    Transcribing,
    Transcribed,
    Summarizing,
    Summarized,
    ExtractingMoments,
    MomentsExtracted,
    Notifying,
    Done,
    Failed(Stage),
}

impl VideoStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, VideoStatus::Done | VideoStatus::Failed(_))
    }

    /// The stage a run has to execute next to make progress from this status.
    /// An in-progress status resumes its own stage.
    pub fn resume_stage(&self) -> Option<Stage> {
        match self {
            VideoStatus::Discovered | VideoStatus::Transcribing => Some(Stage::Transcribe),
            VideoStatus::Transcribed | VideoStatus::Summarizing => Some(Stage::Summarize),
            VideoStatus::Summarized | VideoStatus::ExtractingMoments => Some(Stage::ExtractKeyMoments),
            VideoStatus::MomentsExtracted | VideoStatus::Notifying => Some(Stage::Notify),
            VideoStatus::Done | VideoStatus::Failed(_) => None,
        }
    }

    /// Transitions reachable without an explicit re-run request.
    pub fn can_advance_to(&self, next: VideoStatus) -> bool {
        match (*self, next) {
            (VideoStatus::Done, _) | (VideoStatus::Failed(_), _) => false,
            (current, VideoStatus::Failed(stage)) => current == stage.in_progress(),
            (current, target) => match self.resume_stage() {
                Some(stage) if current == stage.in_progress() => {
                    target == stage.in_progress() || target == stage.completed()
                }
                Some(stage) => target == stage.in_progress(),
                None => false,
            },
        }
    }

    pub fn as_db_str(&self) -> String {
        match self {
            VideoStatus::Discovered => "discovered".to_string(),
            VideoStatus::Transcribing => "transcribing".to_string(),
            VideoStatus::Transcribed => "transcribed".to_string(),
            VideoStatus::Summarizing => "summarizing".to_string(),
            VideoStatus::Summarized => "summarized".to_string(),
            VideoStatus::ExtractingMoments => "extracting_moments".to_string(),
            VideoStatus::MomentsExtracted => "moments_extracted".to_string(),
            VideoStatus::Notifying => "notifying".to_string(),
            VideoStatus::Done => "done".to_string(),
            VideoStatus::Failed(stage) => format!("failed:{}", stage),
        }
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_db_str())
    }
}

impl FromStr for VideoStatus {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self> {
        let status = match value {
            "discovered" => VideoStatus::Discovered,
            "transcribing" => VideoStatus::Transcribing,
            "transcribed" => VideoStatus::Transcribed,
            "summarizing" => VideoStatus::Summarizing,
            "summarized" => VideoStatus::Summarized,
            "extracting_moments" => VideoStatus::ExtractingMoments,
            "moments_extracted" => VideoStatus::MomentsExtracted,
            "notifying" => VideoStatus::Notifying,
            "done" => VideoStatus::Done,
            other => match other.strip_prefix("failed:") {
                Some(stage) => VideoStatus::Failed(stage.parse()?),
                None => return Err(PipelineError::CorruptRecord(format!("unknown status '{}'", other))),
            },
        };
        Ok(status)
    }
}

impl Serialize for VideoStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_db_str())
    }
}

impl<'de> Deserialize<'de> for VideoStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Persistent row of the dedup store, keyed by `video_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub video_id: String,
    pub channel_id: String,
    pub title: String,
    pub first_seen_at: DateTime<Utc>,
    pub status: VideoStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Attempts of the stage currently in progress (or last attempted).
    pub attempt_count: u32,
    pub stage_results: BTreeMap<Stage, Option<String>>,
}

impl ProcessingRecord {
    pub fn empty_stage_results() -> BTreeMap<Stage, Option<String>> {
        Stage::ALL.into_iter().map(|stage| (stage, None)).collect()
    }

    pub fn stage_result(&self, stage: Stage) -> Option<&str> {
        self.stage_results.get(&stage).and_then(|value| value.as_deref())
    }
}

/// One row of the append-only attempt log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAttempt {
    pub video_id: String,
    pub stage: Stage,
    pub status: VideoStatus,
    pub result_ref: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Output of the notify stage: the chat targets that accepted the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub delivered: Vec<ChannelKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

impl StageFailure {
    /// Compact form kept in `stage_results` of a failed record.
    pub fn result_ref(&self) -> String {
        format!("{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    /// Discovery and dedup check only, no stage execution and no writes.
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Disposition {
    Completed,
    Failed(StageFailure),
    SkippedDuplicate,
    SkippedFailed { stage: Stage },
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoOutcome {
    pub video_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub status: VideoStatus,
    pub disposition: Disposition,
    /// Reference to the final artifact (the summary digest) when one exists.
    pub artifact_ref: Option<String>,
    pub summary: Option<String>,
    pub key_moments: Vec<KeyMoment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelReport {
    pub channel_id: String,
    pub name: String,
    pub candidates: usize,
    pub malformed: usize,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub discovered: usize,
    pub skipped_duplicate: usize,
    pub skipped_failed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
}

impl RunCounts {
    pub fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Completed => self.succeeded += 1,
            Disposition::Failed(_) => self.failed += 1,
            Disposition::SkippedDuplicate => self.skipped_duplicate += 1,
            Disposition::SkippedFailed { .. } => self.skipped_failed += 1,
            Disposition::Pending => self.pending += 1,
        }
    }
}

/// Aggregate of one orchestrator invocation, consumed by the digest emitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub lookback_seconds: i64,
    pub videos: Vec<VideoOutcome>,
    pub counts: RunCounts,
    pub channels: Vec<ChannelReport>,
    pub warnings: Vec<String>,
}

impl RunResult {
    pub fn failures(&self) -> impl Iterator<Item = (&VideoOutcome, &StageFailure)> {
        self.videos.iter().filter_map(|video| match &video.disposition {
            Disposition::Failed(failure) => Some((video, failure)),
            _ => None,
        })
    }

    pub fn completed(&self) -> impl Iterator<Item = &VideoOutcome> {
        self.videos
            .iter()
            .filter(|video| video.disposition == Disposition::Completed)
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub max_feed_size_mb: usize,
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "video-pipeline/0.1".to_string(),
            timeout_seconds: 15,
            max_retries: 2,
            retry_delay_seconds: 1,
            max_feed_size_mb: 10,
            max_redirects: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Channel not found: {channel_id}")]
    ChannelNotFound { channel_id: String },

    #[error("Feed unavailable for channel {channel_id}: {reason}")]
    FeedUnavailable { channel_id: String, reason: String },

    #[error("Malformed feed entry: {0}")]
    MalformedEntry(String),

    #[error("Unknown video: {video_id}")]
    UnknownVideo { video_id: String },

    #[error("Invalid status transition for {video_id}: {from} -> {to}")]
    InvalidTransition {
        video_id: String,
        from: VideoStatus,
        to: VideoStatus,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Response from {url} too large: {size_mb}MB")]
    ResponseTooLarge { url: String, size_mb: usize },

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Errors that break the durability guarantee and must abort the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::StoreUnavailable(_) | PipelineError::CorruptRecord(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_db_form() {
        for status in [
            VideoStatus::Discovered,
            VideoStatus::MomentsExtracted,
            VideoStatus::Done,
            VideoStatus::Failed(Stage::ExtractKeyMoments),
        ] {
            assert_eq!(status.as_db_str().parse::<VideoStatus>().unwrap(), status);
        }
        assert!("failed:nope".parse::<VideoStatus>().is_err());
        assert!("finished".parse::<VideoStatus>().is_err());
    }

    #[test]
    fn state_machine_allows_only_forward_steps() {
        use VideoStatus::*;

        assert!(Discovered.can_advance_to(Transcribing));
        assert!(Transcribing.can_advance_to(Transcribing));
        assert!(Transcribing.can_advance_to(Transcribed));
        assert!(Transcribing.can_advance_to(Failed(Stage::Transcribe)));
        assert!(Transcribed.can_advance_to(Summarizing));
        assert!(MomentsExtracted.can_advance_to(Notifying));
        assert!(Notifying.can_advance_to(Done));

        assert!(!Discovered.can_advance_to(Transcribed));
        assert!(!Transcribed.can_advance_to(Failed(Stage::Summarize)));
        assert!(!Summarizing.can_advance_to(Failed(Stage::Transcribe)));
        assert!(!Done.can_advance_to(Transcribing));
        assert!(!Failed(Stage::Summarize).can_advance_to(Summarizing));
    }

    #[test]
    fn resume_stage_follows_last_committed_status() {
        assert_eq!(VideoStatus::Discovered.resume_stage(), Some(Stage::Transcribe));
        assert_eq!(VideoStatus::Transcribed.resume_stage(), Some(Stage::Summarize));
        assert_eq!(VideoStatus::Notifying.resume_stage(), Some(Stage::Notify));
        assert_eq!(VideoStatus::Done.resume_stage(), None);
        assert_eq!(VideoStatus::Failed(Stage::Notify).resume_stage(), None);
    }
}
