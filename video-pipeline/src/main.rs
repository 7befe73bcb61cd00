use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, Level};
use video_pipeline::config::{load_channels_file, parse_channel_kinds};
use video_pipeline::{
    extract_video_id, ChannelRegistry, Collaborators, DedupStore, DigestEmitter, DigestFormat, EmitOptions,
    ExtractiveSummarizer, KeywordMomentExtractor, Pipeline, PipelineConfig, RunOptions, TranscriptPreviews,
    WebhookNotifier, YouTubeFeedSource, YouTubeTranscriptSource,
};

#[derive(Parser, Debug)]
#[command(
    name = "video-pipeline",
    version,
    about = "Poll YouTube channels, process new videos once, and emit a digest"
)]
struct Args {
    /// Look back this many hours (default 24)
    #[arg(short = 'H', long)]
    hours: Option<i64>,

    /// Look back this many days
    #[arg(short = 'd', long, conflicts_with = "hours")]
    days: Option<i64>,

    /// Write the digest here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Digest format: markdown or json
    #[arg(long, value_parser = DigestFormat::from_str)]
    format: Option<DigestFormat>,

    /// Only count new videos per channel
    #[arg(long)]
    quick: bool,

    /// Include the start of each transcript in the digest
    #[arg(short = 't', long, conflicts_with = "quick")]
    transcripts: bool,

    /// Print the monitored channels and exit
    #[arg(short = 'l', long)]
    list_channels: bool,

    /// Discover and check for duplicates without running any stage
    #[arg(long)]
    dry_run: bool,

    /// Drive videos that failed in an earlier run again when they show up
    #[arg(long)]
    retry_failed: bool,

    /// Re-run one stored video (id or URL) and exit
    #[arg(long, value_name = "VIDEO", conflicts_with_all = ["dry_run", "list_channels"])]
    rerun: Option<String>,

    /// Path of the SQLite state database
    #[arg(long)]
    db: Option<PathBuf>,

    /// JSON channel list replacing the built-in registry
    #[arg(long)]
    channels_file: Option<PathBuf>,

    /// Notification targets, comma separated (discord,slack,telegram)
    #[arg(long)]
    notify: Option<String>,

    /// Channels polled concurrently
    #[arg(long)]
    concurrency: Option<usize>,

    /// Debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Errors only
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn log_level(&self) -> Level {
        if self.verbose {
            Level::DEBUG
        } else if self.quiet {
            Level::ERROR
        } else {
            Level::INFO
        }
    }

    fn lookback(&self) -> Option<chrono::Duration> {
        match (self.hours, self.days) {
            (Some(hours), _) => Some(chrono::Duration::hours(hours)),
            (None, Some(days)) => Some(chrono::Duration::days(days)),
            (None, None) => None,
        }
    }

    /// Overlay command line flags on the environment configuration.
    fn apply(&self, mut config: PipelineConfig) -> anyhow::Result<PipelineConfig> {
        if let Some(lookback) = self.lookback() {
            anyhow::ensure!(lookback > chrono::Duration::zero(), "lookback window must be positive");
            config.lookback = lookback;
        }
        if let Some(db) = &self.db {
            config.db_path = db.clone();
        }
        if let Some(path) = &self.channels_file {
            config.channels = load_channels_file(path)
                .with_context(|| format!("failed to load channels from {}", path.display()))?;
        }
        if let Some(notify) = &self.notify {
            config.notifications.enabled = parse_channel_kinds(notify)?;
        }
        if let Some(concurrency) = self.concurrency {
            config.max_concurrent_channels = concurrency.max(1);
        }
        if let Some(format) = self.format {
            config.digest_format = format;
        }
        if self.output.is_some() {
            config.output_path = self.output.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args).await {
        error!("Run aborted: {:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = args.apply(PipelineConfig::from_env()?)?;
    let registry = ChannelRegistry::from_config(&config.channels);

    if args.list_channels {
        println!("Monitored channels ({}):", registry.len());
        for channel in registry.list_channels() {
            println!("  {:<28} {}", channel.channel_id, channel.name);
        }
        return Ok(());
    }

    let store = Arc::new(
        DedupStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open state database {}", config.db_path.display()))?,
    );

    let collaborators = Collaborators {
        transcripts: Arc::new(YouTubeTranscriptSource::new(&config.fetch)?),
        summarizer: Arc::new(ExtractiveSummarizer::new()),
        key_moments: Arc::new(KeywordMomentExtractor::new()?),
        notifier: Arc::new(WebhookNotifier::new(config.notifications.clone(), &config.fetch)?),
    };
    let feed_source = Arc::new(YouTubeFeedSource::new(config.fetch.clone())?);
    let pipeline = Pipeline::new(&config, registry, feed_source, store.clone(), collaborators);

    let result = match &args.rerun {
        Some(video) => {
            let video_id = extract_video_id(video)?;
            pipeline.rerun_video(&video_id).await?
        }
        None => {
            let mut options = RunOptions::new(config.lookback).with_rerun_failed(args.retry_failed);
            if args.dry_run {
                options = options.dry_run();
            }
            pipeline.run(options).await?
        }
    };

    let emit_options = EmitOptions {
        format: config.digest_format,
        output_path: config.output_path.clone(),
        quick: args.quick,
        transcript_previews: args.transcripts,
    };
    let previews = if emit_options.transcript_previews {
        DigestEmitter::load_previews(&store, &result).await?
    } else {
        TranscriptPreviews::new()
    };
    let artifact = DigestEmitter::emit(&result, &emit_options, &previews)?;

    info!(
        "Done: {} succeeded, {} failed, {} skipped; digest at {}",
        result.counts.succeeded,
        result.counts.failed,
        result.counts.skipped_duplicate + result.counts.skipped_failed,
        artifact
    );

    store.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn hours_and_days_are_exclusive() {
        assert!(Args::try_parse_from(["video-pipeline", "--hours", "6", "--days", "2"]).is_err());
        let args = Args::try_parse_from(["video-pipeline", "-d", "2"]).unwrap();
        assert_eq!(args.lookback(), Some(chrono::Duration::days(2)));
    }

    #[test]
    fn verbose_and_quiet_are_exclusive() {
        assert!(Args::try_parse_from(["video-pipeline", "--verbose", "--quiet"]).is_err());
        let args = Args::try_parse_from(["video-pipeline", "-q"]).unwrap();
        assert_eq!(args.log_level(), Level::ERROR);
    }

    #[test]
    fn quick_and_transcripts_are_exclusive() {
        assert!(Args::try_parse_from(["video-pipeline", "--quick", "-t"]).is_err());
        let args = Args::try_parse_from(["video-pipeline", "--quick", "-q"]).unwrap();
        assert!(args.quick);
        assert_eq!(args.log_level(), Level::ERROR);
        assert!(Args::try_parse_from(["video-pipeline", "--transcripts"]).unwrap().transcripts);
    }

    #[test]
    fn flags_override_configuration() {
        let args = Args::try_parse_from([
            "video-pipeline",
            "--db",
            "/tmp/state.db",
            "--notify",
            "slack,discord",
            "--format",
            "json",
            "--concurrency",
            "0",
        ])
        .unwrap();
        let config = args.apply(PipelineConfig::default()).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/state.db"));
        assert_eq!(config.notifications.enabled.len(), 2);
        assert_eq!(config.digest_format, DigestFormat::Json);
        assert_eq!(config.max_concurrent_channels, 1);
    }
}
