pub mod types;
pub mod config;
pub mod registry;
pub mod traits;
pub mod fetcher;
pub mod sources;
pub mod parser;
pub mod poller;
pub mod store;
pub mod executor;
pub mod pipeline;
pub mod digest;
pub mod transcript;
pub mod summarizer;
pub mod notifier;
pub mod utils;

pub use types::*;
pub use config::{DigestFormat, NotificationTargets, PipelineConfig, RetryPolicy};
pub use registry::ChannelRegistry;
pub use traits::FeedSource;
pub use fetcher::Fetcher;
pub use sources::YouTubeFeedSource;
pub use parser::{extract_video_id, FeedParser};
pub use poller::FeedPoller;
pub use store::DedupStore;
pub use executor::{StageExecutor, StageResult};
pub use pipeline::{Collaborators, Pipeline, RunOptions};
pub use digest::{ArtifactRef, DigestEmitter, EmitOptions, TranscriptPreviews};
pub use transcript::YouTubeTranscriptSource;
pub use summarizer::{ExtractiveSummarizer, KeywordMomentExtractor};
pub use notifier::WebhookNotifier;
