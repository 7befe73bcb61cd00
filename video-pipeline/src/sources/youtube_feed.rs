use crate::fetcher::Fetcher;
use crate::traits::FeedSource;
use crate::types::{Channel, FetchConfig, Result};
use async_trait::async_trait;
use tracing::info;

/// Public per-channel RSS feed fetched over HTTP.
pub struct YouTubeFeedSource {
    fetcher: Fetcher,
}

impl YouTubeFeedSource {
    pub fn new(fetch_config: FetchConfig) -> Result<Self> {
        Ok(Self {
            fetcher: Fetcher::new(fetch_config)?,
        })
    }
}

#[async_trait]
impl FeedSource for YouTubeFeedSource {
    fn source_name(&self) -> String {
        "youtube-rss".to_string()
    }

    async fn fetch_feed(&self, channel: &Channel) -> Result<String> {
        info!("Pulling feed for {} ({})", channel.name, channel.feed_url);

        let fetch_result = self.fetcher.fetch(&channel.feed_url).await?;

        info!(
            "Pulled feed for {} in {}ms (HTTP {})",
            channel.name, fetch_result.response_time_ms, fetch_result.http_status
        );
        Ok(fetch_result.content)
    }
}
