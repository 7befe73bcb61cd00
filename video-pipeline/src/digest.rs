use crate::config::DigestFormat;
use crate::store::DedupStore;
use crate::types::{Disposition, Result, RunMode, RunResult, Stage, Transcript, VideoOutcome};
use crate::utils::markdown::escape_link_text;
use crate::utils::time::{format_duration, format_timestamp};
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;
use tracing::{debug, info};

/// Characters of transcript text shown under each video.
pub const TRANSCRIPT_PREVIEW_CHARS: usize = 200;

/// Opening of each completed video's transcript, keyed by video id.
pub type TranscriptPreviews = BTreeMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub format: DigestFormat,
    /// `None` writes to stdout.
    pub output_path: Option<PathBuf>,
    /// Per-channel counts only. Overrides `format`.
    pub quick: bool,
    /// Show the start of each transcript in the Markdown digest.
    pub transcript_previews: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRef {
    File(PathBuf),
    Stdout,
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactRef::File(path) => write!(f, "{}", path.display()),
            ArtifactRef::Stdout => f.write_str("stdout"),
        }
    }
}

/// Renders a `RunResult` into the run digest. Rendering only depends on the
/// result (and previews loaded for it), so emitting the same result twice
/// gives the same document.
pub struct DigestEmitter;

impl DigestEmitter {
    pub fn render(result: &RunResult, options: &EmitOptions, previews: &TranscriptPreviews) -> Result<String> {
        if options.quick {
            return Ok(Self::render_quick(result));
        }
        match options.format {
            DigestFormat::Markdown => Ok(Self::render_markdown_with_previews(result, previews)),
            DigestFormat::Json => Self::render_json(result),
        }
    }

    pub fn render_json(result: &RunResult) -> Result<String> {
        Ok(serde_json::to_string_pretty(result)?)
    }

    /// One line per channel with new videos, busiest first.
    pub fn render_quick(result: &RunResult) -> String {
        let window = (result.lookback_seconds > 0)
            .then(|| format_duration(chrono::Duration::seconds(result.lookback_seconds)));

        let mut by_channel: Vec<(&str, usize)> = Vec::new();
        for video in result.completed() {
            match by_channel.iter_mut().find(|(name, _)| *name == video.channel_name.as_str()) {
                Some((_, count)) => *count += 1,
                None => by_channel.push((video.channel_name.as_str(), 1)),
            }
        }

        if by_channel.is_empty() {
            return match window {
                Some(window) => format!("No new videos in the last {}.\n", window),
                None => "No new videos in this run.\n".to_string(),
            };
        }
        // Stable, so ties keep registry order.
        by_channel.sort_by(|a, b| b.1.cmp(&a.1));

        let mut out = match window {
            Some(window) => format!("YouTube Digest - last {}:\n", window),
            None => "YouTube Digest:\n".to_string(),
        };
        for (name, count) in &by_channel {
            out.push_str(&format!("  {}: {} new video(s)\n", name, count));
        }
        let total: usize = by_channel.iter().map(|(_, count)| count).sum();
        out.push_str(&format!("\nTotal: {} videos from {} channels\n", total, by_channel.len()));
        out
    }

    pub fn render_markdown(result: &RunResult) -> String {
        Self::render_markdown_with_previews(result, &TranscriptPreviews::new())
    }

    pub fn render_markdown_with_previews(result: &RunResult, previews: &TranscriptPreviews) -> String {
        let mut out = String::from("# YouTube Digest\n\n");

        out.push_str(&format!("**Generated:** {}  \n", result.finished_at.format("%Y-%m-%d %H:%M UTC")));
        if result.lookback_seconds > 0 {
            let window = format_duration(chrono::Duration::seconds(result.lookback_seconds));
            out.push_str(&format!("**Window:** last {}  \n", window));
        }
        if result.mode == RunMode::DryRun {
            out.push_str("**Mode:** dry run (nothing was processed)  \n");
        }
        out.push_str(&format!("**Channels:** {}\n\n", result.channels.len()));
        out.push_str("---\n\n");

        if !result.channels.is_empty() {
            out.push_str("| Channel | Candidates | New | Failed | Note |\n");
            out.push_str("|---|---:|---:|---:|---|\n");
            for channel in &result.channels {
                let in_channel = |video: &&VideoOutcome| video.channel_id == channel.channel_id;
                let new = result.completed().filter(in_channel).count();
                let failed = result.failures().filter(|(video, _)| in_channel(video)).count();
                let note = match &channel.warning {
                    Some(_) => "feed unavailable".to_string(),
                    None if channel.malformed > 0 => format!("{} malformed entries", channel.malformed),
                    None => String::new(),
                };
                out.push_str(&format!(
                    "| {} | {} | {} | {} | {} |\n",
                    channel.name, channel.candidates, new, failed, note
                ));
            }
            out.push('\n');
        }

        let completed: Vec<&VideoOutcome> = result.completed().collect();
        if completed.is_empty() {
            out.push_str("No new videos processed in this run.\n\n");
        } else {
            out.push_str("## New videos\n\n");
            let mut current_channel: Option<&str> = None;
            for video in completed {
                if current_channel != Some(video.channel_name.as_str()) {
                    out.push_str(&format!("### {}\n\n", video.channel_name));
                    current_channel = Some(video.channel_name.as_str());
                }
                render_video(&mut out, video, previews.get(&video.video_id));
            }
        }

        let pending: Vec<&VideoOutcome> = result
            .videos
            .iter()
            .filter(|video| video.disposition == Disposition::Pending)
            .collect();
        if !pending.is_empty() {
            out.push_str("## Pending\n\n");
            for video in pending {
                out.push_str(&format!(
                    "- [{}]({}) ({}, {})\n",
                    escape_link_text(&video.title),
                    video.url,
                    video.channel_name,
                    video.status
                ));
            }
            out.push('\n');
        }

        let failures: Vec<_> = result.failures().collect();
        if !failures.is_empty() {
            out.push_str("## Failures\n\n");
            for (video, failure) in failures {
                out.push_str(&format!(
                    "- [{}]({}) ({}): `{}` failed [{}] after {} attempt(s): {}\n",
                    escape_link_text(&video.title),
                    video.url,
                    video.channel_name,
                    failure.stage,
                    failure.kind,
                    failure.attempts,
                    failure.message
                ));
            }
            out.push('\n');
        }

        if !result.warnings.is_empty() {
            out.push_str("## Warnings\n\n");
            for warning in &result.warnings {
                out.push_str(&format!("- {}\n", warning));
            }
            out.push('\n');
        }

        let counts = &result.counts;
        out.push_str("## Totals\n\n");
        out.push_str(&format!("- Discovered: {}\n", counts.discovered));
        out.push_str(&format!("- Succeeded: {}\n", counts.succeeded));
        out.push_str(&format!("- Failed: {}\n", counts.failed));
        out.push_str(&format!("- Skipped (already processed): {}\n", counts.skipped_duplicate));
        out.push_str(&format!("- Skipped (failed in an earlier run): {}\n", counts.skipped_failed));
        if counts.pending > 0 {
            out.push_str(&format!("- Pending: {}\n", counts.pending));
        }

        out
    }

    /// Read the stored transcript of every completed video and keep its first
    /// `TRANSCRIPT_PREVIEW_CHARS` characters.
    pub async fn load_previews(store: &DedupStore, result: &RunResult) -> Result<TranscriptPreviews> {
        let mut previews = TranscriptPreviews::new();
        for video in result.completed() {
            let transcript: Option<Transcript> = store.load_artifact(&video.video_id, Stage::Transcribe).await?;
            let preview: String = match transcript {
                Some(transcript) => transcript.text().chars().take(TRANSCRIPT_PREVIEW_CHARS).collect(),
                None => continue,
            };
            if !preview.is_empty() {
                previews.insert(video.video_id.clone(), preview);
            }
        }
        debug!("Loaded {} transcript previews", previews.len());
        Ok(previews)
    }

    /// Write the rendered digest to the configured path (creating parent
    /// directories) or to stdout.
    pub fn emit(result: &RunResult, options: &EmitOptions, previews: &TranscriptPreviews) -> Result<ArtifactRef> {
        let rendered = Self::render(result, options, previews)?;

        let artifact = match &options.output_path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, rendered.as_bytes())?;
                ArtifactRef::File(path.clone())
            }
            None => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(rendered.as_bytes())?;
                stdout.flush()?;
                ArtifactRef::Stdout
            }
        };

        info!("Digest for run {} written to {}", result.run_id, artifact);
        Ok(artifact)
    }
}

fn render_video(out: &mut String, video: &VideoOutcome, preview: Option<&String>) {
    out.push_str(&format!("#### [{}]({})\n\n", escape_link_text(&video.title), video.url));
    if let Some(published_at) = video.published_at {
        out.push_str(&format!("**Published:** {}\n\n", published_at.format("%Y-%m-%d %H:%M")));
    }
    if let Some(summary) = &video.summary {
        out.push_str(&format!("**Summary:** {}\n\n", summary));
    }
    if let Some(preview) = preview {
        out.push_str(&format!("**Transcript Preview:** {}...\n\n", preview));
    }
    if !video.key_moments.is_empty() {
        out.push_str("**Key moments:**\n\n");
        for moment in &video.key_moments {
            out.push_str(&format!(
                "- [{}]({}) {}\n",
                format_timestamp(moment.offset),
                timestamp_link(&video.url, moment.offset),
                moment.label
            ));
        }
        out.push('\n');
    }
    out.push_str("---\n\n");
}

fn timestamp_link(url: &str, offset: f64) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}t={}", url, separator, offset.max(0.0) as u64)
}
