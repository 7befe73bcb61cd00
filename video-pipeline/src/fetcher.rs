use crate::types::{FetchConfig, PipelineError, Result};
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

/// Body and timing of a successful fetch.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub content: String,
    pub http_status: u16,
    pub fetch_time: DateTime<Utc>,
    pub response_time_ms: u64,
}

pub struct Fetcher {
    client: Client,
    config: FetchConfig,
    rate_limiter: Arc<Mutex<HashMap<String, Instant>>>,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self {
            client,
            config,
            rate_limiter: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// GET `url`, retrying transport errors and non-success statuses with
    /// exponential backoff up to `max_retries` extra attempts.
    pub async fn fetch(&self, url: &str) -> Result<FetchResult> {
        let start_time = Instant::now();
        let fetch_time = Utc::now();

        debug!("Fetching: {}", url);

        self.apply_rate_limit(url).await?;

        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_secs(self.config.retry_delay_seconds),
            initial_interval: Duration::from_secs(self.config.retry_delay_seconds),
            max_interval: Duration::from_secs(self.config.retry_delay_seconds * 32),
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(self.config.retry_delay_seconds * 60)),
            ..Default::default()
        };

        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match self.fetch_once(url).await {
                Ok((status, content)) => {
                    info!("Fetched {} ({} bytes)", url, content.len());
                    return Ok(FetchResult {
                        url: url.to_string(),
                        content,
                        http_status: status,
                        fetch_time,
                        response_time_ms: start_time.elapsed().as_millis() as u64,
                    });
                }
                // Oversized bodies will not shrink on retry.
                Err(e @ PipelineError::ResponseTooLarge { .. }) => return Err(e),
                Err(e) => {
                    last_error = Some(e);

                    if attempt < self.config.max_retries {
                        if let Some(delay) = backoff.next_backoff() {
                            warn!("Attempt {} failed for {}, retrying in {:?}", attempt + 1, url, delay);
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                    break;
                }
            }
        }

        error!("Failed to fetch after {} attempts: {}", self.config.max_retries + 1, url);
        Err(last_error.unwrap_or_else(|| PipelineError::HttpStatus {
            url: url.to_string(),
            status: 0,
        }))
    }

    async fn fetch_once(&self, url: &str) -> Result<(u16, String)> {
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(PipelineError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if let Some(content_length) = response.content_length() {
            let size_mb = content_length as usize / (1024 * 1024);
            if size_mb > self.config.max_feed_size_mb {
                return Err(PipelineError::ResponseTooLarge {
                    url: url.to_string(),
                    size_mb,
                });
            }
        }

        let content = response.text().await?;
        Ok((status.as_u16(), content))
    }

    async fn apply_rate_limit(&self, url: &str) -> Result<Duration> {
        let parsed_url = Url::parse(url)?;
        let host = parsed_url.host_str().unwrap_or("").to_string();

        let min_interval = Duration::from_millis(250); // between requests to the same host

        // Reserve this host's next slot under the lock, sleep after releasing it.
        let wait_time = {
            let mut rate_limiter = self.rate_limiter.lock().await;
            let now = Instant::now();
            let slot = match rate_limiter.get(&host) {
                Some(last_slot) => (*last_slot + min_interval).max(now),
                None => now,
            };
            rate_limiter.insert(host.clone(), slot);
            slot - now
        };

        if !wait_time.is_zero() {
            debug!("Rate limiting {}: waiting {:?}", host, wait_time);
            tokio::time::sleep(wait_time).await;
        }

        Ok(wait_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limit_waits_only_for_the_same_host() {
        let fetcher = Fetcher::new(FetchConfig::default()).unwrap();

        let first = fetcher.apply_rate_limit("https://www.youtube.com/feeds/a").await.unwrap();
        assert!(first.is_zero());

        let started = Instant::now();
        let (same_host, other_host) = tokio::join!(
            fetcher.apply_rate_limit("https://www.youtube.com/feeds/b"),
            async {
                let waited = fetcher.apply_rate_limit("https://example.com/feed").await.unwrap();
                (waited, started.elapsed())
            }
        );

        assert!(same_host.unwrap() > Duration::from_millis(100));
        let (other_wait, other_elapsed) = other_host;
        assert!(other_wait.is_zero());
        // Not held up behind the other host's sleep.
        assert!(other_elapsed < Duration::from_millis(200));
    }
}
