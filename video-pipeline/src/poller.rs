use crate::parser::FeedParser;
use crate::traits::FeedSource;
use crate::types::{Candidate, Channel, PipelineError, Result};
use chrono::{DateTime, Utc};
use feed_rs::model::Entry;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct FeedPoller {
    source: Arc<dyn FeedSource>,
}

impl FeedPoller {
    pub fn new(source: Arc<dyn FeedSource>) -> Self {
        Self { source }
    }

    /// Fetch and parse `channel`'s feed. The returned iterator yields
    /// candidates published at or after `since`, in feed order.
    pub async fn poll(&self, channel: &Channel, since: DateTime<Utc>) -> Result<Poll> {
        debug!("Polling {} via {} since {}", channel.channel_id, self.source.source_name(), since);

        let unavailable = |reason: String| PipelineError::FeedUnavailable {
            channel_id: channel.channel_id.clone(),
            reason,
        };

        let content = self
            .source
            .fetch_feed(channel)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let feed = FeedParser::parse_feed(&content).map_err(|e| unavailable(e.to_string()))?;

        info!(
            "Feed for {} has {} entries ({})",
            channel.name,
            feed.entries.len(),
            feed.title.as_deref().unwrap_or("untitled")
        );

        Ok(Poll {
            channel_id: channel.channel_id.clone(),
            since,
            entries: feed.entries.into_iter(),
            malformed: 0,
        })
    }
}

/// Lazy sequence of candidates from one poll. Malformed entries are logged
/// and skipped without ending the sequence.
pub struct Poll {
    channel_id: String,
    since: DateTime<Utc>,
    entries: std::vec::IntoIter<Entry>,
    malformed: usize,
}

impl Poll {
    /// Entries skipped so far because no id or timestamp could be recovered.
    pub fn malformed(&self) -> usize {
        self.malformed
    }
}

impl Iterator for Poll {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        loop {
            let entry = self.entries.next()?;
            match FeedParser::parse_entry(&entry, &self.channel_id) {
                Ok(candidate) if candidate.published_at < self.since => {
                    debug!("Skipping {} published {} (outside window)", candidate.video_id, candidate.published_at);
                }
                Ok(candidate) => return Some(candidate),
                Err(e) => {
                    warn!("Skipping malformed entry in {}: {}", self.channel_id, e);
                    self.malformed += 1;
                }
            }
        }
    }
}
