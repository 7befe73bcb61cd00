#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use video_pipeline::types::*;
use video_pipeline::{
    ChannelRegistry, Collaborators, DedupStore, FeedSource, Pipeline, PipelineConfig, RetryPolicy,
};
use interfaces::{
    CapabilityResult, KeyMomentExtractor, NotificationDispatcher, Summarizer, TranscriptSource,
};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Retry policy without sleeping between attempts.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_base_delay(Duration::ZERO)
        .with_attempt_timeout(Duration::from_millis(500))
}

/// YouTube-shaped Atom document with one entry per `(video_id, title, published)`.
pub fn feed_xml(channel_id: &str, entries: &[(&str, &str, DateTime<Utc>)]) -> String {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015" xmlns="http://www.w3.org/2005/Atom">
  <id>yt:channel:{channel_id}</id>
  <title>Channel {channel_id}</title>
  <updated>2024-05-01T00:00:00+00:00</updated>
"#
    );
    for (video_id, title, published) in entries {
        xml.push_str(&format!(
            r#"  <entry>
    <id>yt:video:{video_id}</id>
    <yt:videoId>{video_id}</yt:videoId>
    <yt:channelId>{channel_id}</yt:channelId>
    <title>{title}</title>
    <link rel="alternate" href="https://www.youtube.com/watch?v={video_id}"/>
    <published>{published}</published>
    <updated>{published}</updated>
  </entry>
"#,
            published = published.to_rfc3339()
        ));
    }
    xml.push_str("</feed>\n");
    xml
}

/// Serves canned feed documents keyed by channel id. Unknown channels answer
/// like an unreachable server.
#[derive(Default)]
pub struct StaticFeedSource {
    feeds: Mutex<HashMap<String, String>>,
}

impl StaticFeedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_feed(&self, channel_id: &str, xml: String) {
        self.feeds.lock().unwrap().insert(channel_id.to_string(), xml);
    }
}

#[async_trait]
impl FeedSource for StaticFeedSource {
    fn source_name(&self) -> String {
        "static".to_string()
    }

    async fn fetch_feed(&self, channel: &Channel) -> Result<String> {
        self.feeds
            .lock()
            .unwrap()
            .get(&channel.channel_id)
            .cloned()
            .ok_or_else(|| PipelineError::HttpStatus {
                url: channel.feed_url.clone(),
                status: 503,
            })
    }
}

/// Queued failures per key plus a call log. A call pops the next queued
/// failure for its key, or succeeds when none is left.
#[derive(Default)]
pub struct Script {
    failures: Mutex<HashMap<String, VecDeque<CapabilityError>>>,
    always: Mutex<HashMap<String, CapabilityError>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<String>>,
}

impl Script {
    pub fn fail_times(&self, key: &str, errors: Vec<CapabilityError>) {
        self.failures.lock().unwrap().insert(key.to_string(), errors.into());
    }

    pub fn fail_always(&self, key: &str, error: CapabilityError) {
        self.always.lock().unwrap().insert(key.to_string(), error);
    }

    pub fn delay(&self, key: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(key.to_string(), delay);
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|call| call.as_str() == key).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    async fn call(&self, key: &str) -> CapabilityResult<()> {
        self.calls.lock().unwrap().push(key.to_string());

        let delay = self.delays.lock().unwrap().get(key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.always.lock().unwrap().get(key) {
            return Err(error.clone());
        }
        match self.failures.lock().unwrap().get_mut(key).and_then(|queue| queue.pop_front()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Key registered in this script that occurs in `text`, else `text`.
    fn key_in(&self, text: &str) -> String {
        let failures = self.failures.lock().unwrap();
        let always = self.always.lock().unwrap();
        failures
            .keys()
            .chain(always.keys())
            .find(|key| text.contains(key.as_str()))
            .cloned()
            .unwrap_or_else(|| text.to_string())
    }
}

/// Transcript whose text names the video, so later stages can be keyed on it.
pub fn transcript_for(video_id: &str) -> Transcript {
    Transcript::new(vec![
        TranscriptSegment {
            start: 0.0,
            duration: 5.0,
            text: format!("Welcome to the video about {}.", video_id),
        },
        TranscriptSegment {
            start: 60.0,
            duration: 5.0,
            text: "The key takeaway is important to remember.".to_string(),
        },
    ])
}

#[derive(Default)]
pub struct ScriptedTranscripts {
    pub script: Script,
}

#[async_trait]
impl TranscriptSource for ScriptedTranscripts {
    async fn fetch_transcript(&self, video_id: &str) -> CapabilityResult<Transcript> {
        self.script.call(video_id).await?;
        Ok(transcript_for(video_id))
    }
}

#[derive(Default)]
pub struct ScriptedSummarizer {
    pub script: Script,
}

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn summarize(&self, text: &str, max_length: usize) -> CapabilityResult<String> {
        let key = self.script.key_in(text);
        self.script.call(&key).await?;
        Ok(format!("Summary: {}", text.chars().take(max_length).collect::<String>()))
    }
}

#[derive(Default)]
pub struct ScriptedMoments {
    pub script: Script,
}

#[async_trait]
impl KeyMomentExtractor for ScriptedMoments {
    async fn extract_key_moments(&self, transcript: &Transcript, count: usize) -> CapabilityResult<Vec<KeyMoment>> {
        let key = self.script.key_in(&transcript.text());
        self.script.call(&key).await?;
        Ok(transcript
            .segments
            .iter()
            .take(count)
            .map(|segment| KeyMoment {
                offset: segment.start,
                label: segment.text.clone(),
            })
            .collect())
    }
}

/// Records every successful delivery as `(kind, video_id)`.
#[derive(Default)]
pub struct RecordingNotifier {
    pub script: Script,
    delivered: Mutex<Vec<(ChannelKind, String)>>,
}

impl RecordingNotifier {
    pub fn delivered(&self) -> Vec<(ChannelKind, String)> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn deliveries_for(&self, video_id: &str) -> usize {
        self.delivered().iter().filter(|(_, id)| id == video_id).count()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn dispatch_notification(&self, channel_kind: ChannelKind, payload: &NotificationPayload) -> CapabilityResult<()> {
        self.script.call(&format!("{}:{}", channel_kind, payload.video_id)).await?;
        self.delivered
            .lock()
            .unwrap()
            .push((channel_kind, payload.video_id.clone()));
        Ok(())
    }
}

/// A pipeline wired to scripted collaborators and an on-disk store.
pub struct Harness {
    pub feeds: Arc<StaticFeedSource>,
    pub store: Arc<DedupStore>,
    pub transcripts: Arc<ScriptedTranscripts>,
    pub summarizer: Arc<ScriptedSummarizer>,
    pub moments: Arc<ScriptedMoments>,
    pub notifier: Arc<RecordingNotifier>,
    pub pipeline: Pipeline,
}

impl Harness {
    pub async fn open(db_path: &Path, channels: Vec<Channel>) -> Result<Self> {
        Self::with_config(db_path, channels, |_| {}).await
    }

    pub async fn with_config<F>(db_path: &Path, channels: Vec<Channel>, tweak: F) -> Result<Self>
    where
        F: FnOnce(&mut PipelineConfig),
    {
        init_tracing();

        let mut config = PipelineConfig::default()
            .with_db_path(db_path)
            .with_channels(channels);
        config.retry = fast_retry();
        config.notifications.enabled = vec![ChannelKind::Discord, ChannelKind::Slack];
        tweak(&mut config);

        let feeds = Arc::new(StaticFeedSource::new());
        let store = Arc::new(DedupStore::open(&config.db_path).await?);
        let transcripts = Arc::new(ScriptedTranscripts::default());
        let summarizer = Arc::new(ScriptedSummarizer::default());
        let moments = Arc::new(ScriptedMoments::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let collaborators = Collaborators {
            transcripts: transcripts.clone(),
            summarizer: summarizer.clone(),
            key_moments: moments.clone(),
            notifier: notifier.clone(),
        };
        let registry = ChannelRegistry::from_config(&config.channels);
        let pipeline = Pipeline::new(&config, registry, feeds.clone(), store.clone(), collaborators);

        Ok(Self {
            feeds,
            store,
            transcripts,
            summarizer,
            moments,
            notifier,
            pipeline,
        })
    }
}

pub fn channel(channel_id: &str, name: &str) -> Channel {
    Channel::youtube(channel_id, name)
}

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::hours(hours)
}
