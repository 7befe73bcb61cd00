use crate::config::PipelineConfig;
use crate::executor::StageExecutor;
use crate::poller::FeedPoller;
use crate::registry::ChannelRegistry;
use crate::store::DedupStore;
use crate::traits::FeedSource;
use crate::types::{
    watch_url, Candidate, Channel, ChannelReport, DeliveryReceipt, Disposition, KeyMoment, PipelineError,
    ProcessingRecord, Result, RunCounts, RunMode, RunResult, Stage, StageFailure, Transcript, VideoOutcome,
    VideoStatus,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use interfaces::{
    CapabilityResult, ChannelKind, KeyMomentExtractor, NotificationDispatcher, NotificationPayload, Summarizer,
    TranscriptSource,
};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The external capabilities the stages call into.
#[derive(Clone)]
pub struct Collaborators {
    pub transcripts: Arc<dyn TranscriptSource>,
    pub summarizer: Arc<dyn Summarizer>,
    pub key_moments: Arc<dyn KeyMomentExtractor>,
    pub notifier: Arc<dyn NotificationDispatcher>,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub lookback: chrono::Duration,
    pub mode: RunMode,
    /// Reset `failed(stage)` records seen in the feed and drive them again.
    pub rerun_failed: bool,
}

impl RunOptions {
    pub fn new(lookback: chrono::Duration) -> Self {
        Self {
            lookback,
            mode: RunMode::Full,
            rerun_failed: false,
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.mode = RunMode::DryRun;
        self
    }

    pub fn with_rerun_failed(mut self, rerun_failed: bool) -> Self {
        self.rerun_failed = rerun_failed;
        self
    }
}

/// Identity of one run and the videos it has already handled.
struct RunScope {
    owner: String,
    claimed: Mutex<HashSet<String>>,
}

struct ChannelRun {
    report: ChannelReport,
    videos: Vec<VideoOutcome>,
    warnings: Vec<String>,
}

/// Where a video came from, carried into its outcome.
struct VideoContext<'a> {
    channel_name: &'a str,
    url: String,
    published_at: Option<DateTime<Utc>>,
}

pub struct Pipeline {
    registry: ChannelRegistry,
    poller: FeedPoller,
    store: Arc<DedupStore>,
    executor: StageExecutor,
    collaborators: Collaborators,
    notify_targets: Vec<ChannelKind>,
    summary_max_length: usize,
    key_moment_count: usize,
    max_concurrent_channels: usize,
    claim_ttl: chrono::Duration,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        registry: ChannelRegistry,
        feed_source: Arc<dyn FeedSource>,
        store: Arc<DedupStore>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            registry,
            poller: FeedPoller::new(feed_source),
            executor: StageExecutor::new(store.clone(), config.retry),
            store,
            collaborators,
            notify_targets: config.notifications.enabled.clone(),
            summary_max_length: config.summary_max_length,
            key_moment_count: config.key_moment_count,
            max_concurrent_channels: config.max_concurrent_channels.max(1),
            claim_ttl: config.claim_ttl,
        }
    }

    /// One sweep over every registered channel. Per-video and per-channel
    /// failures are folded into the result; only store failures abort.
    pub async fn run(&self, options: RunOptions) -> Result<RunResult> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let since = started_at - options.lookback;

        info!(
            "Run {} starting: {} channels, window since {}, mode {:?}",
            run_id,
            self.registry.len(),
            since,
            options.mode
        );

        let scope = RunScope {
            owner: run_id.to_string(),
            claimed: Mutex::new(HashSet::new()),
        };
        let channel_runs: Vec<ChannelRun> = stream::iter(self.registry.list_channels())
            .map(|channel| self.run_channel(channel, since, &options, &scope))
            .buffered(self.max_concurrent_channels)
            .try_collect()
            .await?;

        let mut result = RunResult {
            run_id,
            mode: options.mode,
            started_at,
            finished_at: started_at,
            lookback_seconds: options.lookback.num_seconds(),
            videos: Vec::new(),
            counts: RunCounts::default(),
            channels: Vec::new(),
            warnings: Vec::new(),
        };

        for channel_run in channel_runs {
            result.counts.discovered += channel_run.report.candidates;
            for video in &channel_run.videos {
                result.counts.record(&video.disposition);
            }
            result.videos.extend(channel_run.videos);
            result.warnings.extend(channel_run.warnings);
            result.channels.push(channel_run.report);
        }
        result.finished_at = Utc::now();

        info!(
            "Run {} finished: discovered={}, duplicates={}, succeeded={}, failed={}, skipped_failed={}, pending={}",
            run_id,
            result.counts.discovered,
            result.counts.skipped_duplicate,
            result.counts.succeeded,
            result.counts.failed,
            result.counts.skipped_failed,
            result.counts.pending
        );
        Ok(result)
    }

    /// Explicit manual re-run of one stored video, outside any feed window.
    pub async fn rerun_video(&self, video_id: &str) -> Result<RunResult> {
        let run_id = Uuid::new_v4();
        let owner = run_id.to_string();
        let started_at = Utc::now();

        let record = self.store.get(video_id).await?.ok_or_else(|| PipelineError::UnknownVideo {
            video_id: video_id.to_string(),
        })?;
        let channel_name = self
            .registry
            .get_channel(&record.channel_id)
            .map(|channel| channel.name.clone())
            .unwrap_or_else(|_| record.channel_id.clone());

        let candidate = Candidate {
            video_id: record.video_id.clone(),
            channel_id: record.channel_id.clone(),
            title: record.title.clone(),
            published_at: record.first_seen_at,
            url: watch_url(video_id),
        };
        let context = VideoContext {
            channel_name: &channel_name,
            url: candidate.url.clone(),
            published_at: None,
        };

        info!("Re-running {} from {}", video_id, record.status);
        let mut warnings = Vec::new();
        let outcome = self
            .drive_exclusively(&candidate, &context, &owner, record.status, &mut warnings, || async {
                let record = self.store.reset_for_rerun(video_id, started_at).await?;
                self.drive_video(&record, &context).await
            })
            .await?;

        let mut counts = RunCounts {
            discovered: 1,
            ..RunCounts::default()
        };
        counts.record(&outcome.disposition);

        Ok(RunResult {
            run_id,
            mode: RunMode::Full,
            started_at,
            finished_at: Utc::now(),
            lookback_seconds: 0,
            videos: vec![outcome],
            counts,
            channels: Vec::new(),
            warnings,
        })
    }

    async fn run_channel(
        &self,
        channel: &Channel,
        since: DateTime<Utc>,
        options: &RunOptions,
        scope: &RunScope,
    ) -> Result<ChannelRun> {
        let mut run = ChannelRun {
            report: ChannelReport {
                channel_id: channel.channel_id.clone(),
                name: channel.name.clone(),
                ..ChannelReport::default()
            },
            videos: Vec::new(),
            warnings: Vec::new(),
        };

        let mut poll = match self.poller.poll(channel, since).await {
            Ok(poll) => poll,
            Err(e) => {
                warn!("Channel {} yields no candidates this run: {}", channel.name, e);
                run.report.warning = Some(e.to_string());
                run.warnings.push(format!("{}: {}", channel.name, e));
                return Ok(run);
            }
        };

        while let Some(candidate) = poll.next() {
            run.report.candidates += 1;
            let outcome = self.process_candidate(channel, candidate, options, scope, &mut run.warnings).await?;
            run.videos.push(outcome);
        }
        run.report.malformed = poll.malformed();

        if run.report.malformed > 0 {
            run.warnings.push(format!("{}: skipped {} malformed entries", channel.name, run.report.malformed));
        }
        info!("Channel {}: {} candidates", channel.name, run.report.candidates);
        Ok(run)
    }

    async fn process_candidate(
        &self,
        channel: &Channel,
        candidate: Candidate,
        options: &RunOptions,
        scope: &RunScope,
        warnings: &mut Vec<String>,
    ) -> Result<VideoOutcome> {
        let context = VideoContext {
            channel_name: &channel.name,
            url: candidate.url.clone(),
            published_at: Some(candidate.published_at),
        };

        let first_claim = scope.claimed.lock().await.insert(candidate.video_id.clone());
        if !first_claim {
            debug!("{} already handled in this run", candidate.video_id);
            let status = self
                .store
                .get(&candidate.video_id)
                .await?
                .map(|record| record.status)
                .unwrap_or(VideoStatus::Discovered);
            return Ok(skipped(&candidate, &context, status, Disposition::SkippedDuplicate));
        }

        if options.mode == RunMode::DryRun {
            return self.preview_candidate(&candidate, &context, options).await;
        }

        let record = self
            .store
            .create_if_absent(&candidate.video_id, &candidate.channel_id, &candidate.title, Utc::now())
            .await?;

        if record.channel_id != candidate.channel_id {
            let message = format!(
                "{} seen on {} but recorded under {}",
                candidate.video_id, candidate.channel_id, record.channel_id
            );
            warn!("{}", message);
            warnings.push(message);
        }

        if let Some(disposition) = settled(record.status, options) {
            debug!("{} is {} from an earlier run, skipping", candidate.video_id, record.status);
            return Ok(skipped(&candidate, &context, record.status, disposition));
        }

        self.drive_exclusively(&candidate, &context, &scope.owner, record.status, warnings, || {
            self.drive_leased(&candidate, &context, options)
        })
        .await
    }

    /// Run `drive` while holding the video's lease. A video leased by another
    /// run, or changed underneath this one, is reported as a duplicate with a
    /// warning; only fatal store errors escape.
    async fn drive_exclusively<F, Fut>(
        &self,
        candidate: &Candidate,
        context: &VideoContext<'_>,
        owner: &str,
        status: VideoStatus,
        warnings: &mut Vec<String>,
        drive: F,
    ) -> Result<VideoOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<VideoOutcome>>,
    {
        let video_id = candidate.video_id.as_str();
        if !self.store.acquire_lease(video_id, owner, self.claim_ttl, Utc::now()).await? {
            let message = format!("{} is held by another run", video_id);
            warn!("{}", message);
            warnings.push(message);
            return Ok(skipped(candidate, context, status, Disposition::SkippedDuplicate));
        }

        let outcome = match drive().await {
            Ok(outcome) => outcome,
            Err(e) if !e.is_fatal() => {
                let message = format!("{} changed by another run: {}", video_id, e);
                warn!("{}", message);
                warnings.push(message);
                let current = self.store.get(video_id).await?.map(|record| record.status).unwrap_or(status);
                skipped(candidate, context, current, Disposition::SkippedDuplicate)
            }
            Err(e) => return Err(e),
        };

        self.store.release_lease(video_id, owner).await?;
        Ok(outcome)
    }

    /// Re-read the record under the lease and drive whatever it still needs.
    async fn drive_leased(
        &self,
        candidate: &Candidate,
        context: &VideoContext<'_>,
        options: &RunOptions,
    ) -> Result<VideoOutcome> {
        let record = self
            .store
            .get(&candidate.video_id)
            .await?
            .ok_or_else(|| PipelineError::UnknownVideo {
                video_id: candidate.video_id.clone(),
            })?;

        if let Some(disposition) = settled(record.status, options) {
            debug!("{} settled by another run as {}", candidate.video_id, record.status);
            return Ok(skipped(candidate, context, record.status, disposition));
        }

        let record = match record.status {
            VideoStatus::Failed(_) => self.store.reset_for_rerun(&candidate.video_id, Utc::now()).await?,
            _ => record,
        };
        self.drive_video(&record, context).await
    }

    /// Dry-run view of a candidate: reads the store, writes nothing.
    async fn preview_candidate(
        &self,
        candidate: &Candidate,
        context: &VideoContext<'_>,
        options: &RunOptions,
    ) -> Result<VideoOutcome> {
        let (status, disposition) = match self.store.get(&candidate.video_id).await? {
            None => (VideoStatus::Discovered, Disposition::Pending),
            Some(record) => (
                record.status,
                settled(record.status, options).unwrap_or(Disposition::Pending),
            ),
        };
        Ok(skipped(candidate, context, status, disposition))
    }

    /// Run every stage the record still needs, strictly in order.
    async fn drive_video(&self, record: &ProcessingRecord, context: &VideoContext<'_>) -> Result<VideoOutcome> {
        let video_id = record.video_id.as_str();
        let mut transcript: Option<Transcript> = None;
        let mut summary: Option<String> = None;
        let mut moments: Option<Vec<KeyMoment>> = None;
        let mut failure: Option<StageFailure> = None;

        let mut next = record.status.resume_stage();
        while let Some(stage) = next {
            let step = match stage {
                Stage::Transcribe => self
                    .executor
                    .run_stage(video_id, stage, || self.collaborators.transcripts.fetch_transcript(video_id))
                    .await?
                    .into_result()
                    .map(|output| transcript = Some(output)),
                Stage::Summarize => {
                    let text = match &transcript {
                        Some(transcript) => transcript.text(),
                        None => self.load_required::<Transcript>(video_id, Stage::Transcribe).await?.text(),
                    };
                    self.executor
                        .run_stage(video_id, stage, || {
                            self.collaborators.summarizer.summarize(&text, self.summary_max_length)
                        })
                        .await?
                        .into_result()
                        .map(|output| summary = Some(output))
                }
                Stage::ExtractKeyMoments => {
                    let source = match transcript.take() {
                        Some(transcript) => transcript,
                        None => self.load_required::<Transcript>(video_id, Stage::Transcribe).await?,
                    };
                    self.executor
                        .run_stage(video_id, stage, || {
                            self.collaborators
                                .key_moments
                                .extract_key_moments(&source, self.key_moment_count)
                        })
                        .await?
                        .into_result()
                        .map(|output| moments = Some(output))
                }
                Stage::Notify => {
                    if summary.is_none() {
                        summary = Some(self.load_required::<String>(video_id, Stage::Summarize).await?);
                    }
                    let payload = NotificationPayload {
                        video_id: video_id.to_string(),
                        title: record.title.clone(),
                        body: summary.clone().unwrap_or_default(),
                        url: context.url.clone(),
                        channel_name: context.channel_name.to_string(),
                        thumbnail: Some(format!("https://i.ytimg.com/vi/{}/hqdefault.jpg", video_id)),
                    };
                    let delivered = Mutex::new(Vec::new());
                    self.executor
                        .run_stage(video_id, stage, || self.deliver(&payload, &delivered))
                        .await?
                        .into_result()
                        .map(|_| ())
                }
            };

            match step {
                Ok(()) => next = stage.next(),
                Err(stage_failure) => {
                    failure = Some(stage_failure);
                    break;
                }
            }
        }

        if summary.is_none() {
            summary = self.store.load_artifact(video_id, Stage::Summarize).await?;
        }
        if moments.is_none() {
            moments = self.store.load_artifact(video_id, Stage::ExtractKeyMoments).await?;
        }

        let stored = self.store.get(video_id).await?.ok_or_else(|| PipelineError::UnknownVideo {
            video_id: video_id.to_string(),
        })?;

        let disposition = match failure {
            Some(failure) => Disposition::Failed(failure),
            None => Disposition::Completed,
        };

        Ok(VideoOutcome {
            video_id: video_id.to_string(),
            channel_id: record.channel_id.clone(),
            channel_name: context.channel_name.to_string(),
            title: record.title.clone(),
            url: context.url.clone(),
            published_at: context.published_at,
            status: stored.status,
            disposition,
            artifact_ref: stored.stage_result(Stage::Summarize).map(str::to_string),
            summary,
            key_moments: moments.unwrap_or_default(),
        })
    }

    /// Send `payload` to every configured target not yet reached in this
    /// notify stage.
    async fn deliver(
        &self,
        payload: &NotificationPayload,
        delivered: &Mutex<Vec<ChannelKind>>,
    ) -> CapabilityResult<DeliveryReceipt> {
        for kind in &self.notify_targets {
            if delivered.lock().await.contains(kind) {
                continue;
            }
            self.collaborators.notifier.dispatch_notification(*kind, payload).await?;
            delivered.lock().await.push(*kind);
        }

        Ok(DeliveryReceipt {
            delivered: delivered.lock().await.clone(),
        })
    }

    async fn load_required<T: DeserializeOwned>(&self, video_id: &str, stage: Stage) -> Result<T> {
        self.store.load_artifact(video_id, stage).await?.ok_or_else(|| {
            PipelineError::CorruptRecord(format!("{} completed for {} but its artifact is missing", stage, video_id))
        })
    }
}

/// Disposition of a record this run leaves alone, if it is one.
fn settled(status: VideoStatus, options: &RunOptions) -> Option<Disposition> {
    match status {
        VideoStatus::Done => Some(Disposition::SkippedDuplicate),
        VideoStatus::Failed(stage) if !options.rerun_failed => Some(Disposition::SkippedFailed { stage }),
        _ => None,
    }
}

fn skipped(candidate: &Candidate, context: &VideoContext<'_>, status: VideoStatus, disposition: Disposition) -> VideoOutcome {
    VideoOutcome {
        video_id: candidate.video_id.clone(),
        channel_id: candidate.channel_id.clone(),
        channel_name: context.channel_name.to_string(),
        title: candidate.title.clone(),
        url: context.url.clone(),
        published_at: context.published_at,
        status,
        disposition,
        artifact_ref: None,
        summary: None,
        key_moments: Vec::new(),
    }
}
