use crate::types::{Channel, Result};
use async_trait::async_trait;

/// Source of a channel's raw feed document.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Human-readable name for this source
    fn source_name(&self) -> String;

    /// Fetch the feed document for `channel`. Transport failures surface as
    /// errors; the poller turns them into `FeedUnavailable`.
    async fn fetch_feed(&self, channel: &Channel) -> Result<String>;
}
