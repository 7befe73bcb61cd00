use crate::config::RetryPolicy;
use crate::store::DedupStore;
use crate::types::{
    DeliveryReceipt, KeyMoment, Result, Stage, StageFailure, Transcript, VideoStatus,
};
use crate::utils::text::truncate_on_word;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use chrono::Utc;
use interfaces::{CapabilityError, CapabilityResult};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Output of a stage that can be persisted and referenced from the record.
pub trait StageArtifact: Serialize + Send + Sync {
    /// Short reference kept in `stage_results`.
    fn result_ref(&self) -> String;
}

impl StageArtifact for Transcript {
    fn result_ref(&self) -> String {
        format!("{} segments, {} chars", self.segments.len(), self.text().chars().count())
    }
}

impl StageArtifact for String {
    fn result_ref(&self) -> String {
        truncate_on_word(self, 80)
    }
}

impl StageArtifact for Vec<KeyMoment> {
    fn result_ref(&self) -> String {
        format!("{} key moments", self.len())
    }
}

impl StageArtifact for DeliveryReceipt {
    fn result_ref(&self) -> String {
        if self.delivered.is_empty() {
            "no targets configured".to_string()
        } else {
            let targets: Vec<&str> = self.delivered.iter().map(|kind| kind.as_str()).collect();
            format!("delivered: {}", targets.join(","))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageResult<T> {
    Completed(T),
    Failed(StageFailure),
}

impl<T> StageResult<T> {
    pub fn into_result(self) -> std::result::Result<T, StageFailure> {
        match self {
            StageResult::Completed(output) => Ok(output),
            StageResult::Failed(failure) => Err(failure),
        }
    }
}

/// Runs one stage against one video with the retry policy, recording every
/// attempt in the store before it starts and the outcome after it ends.
pub struct StageExecutor {
    store: Arc<DedupStore>,
    policy: RetryPolicy,
}

impl StageExecutor {
    pub fn new(store: Arc<DedupStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    fn backoff(&self) -> ExponentialBackoff<backoff::SystemClock> {
        let first_delay = self.policy.base_delay * 2;
        ExponentialBackoff {
            current_interval: first_delay,
            initial_interval: first_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: first_delay * 2u32.saturating_pow(self.policy.max_attempts),
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Drive `op` until it succeeds, fails permanently, or the attempt budget
    /// is spent. Only store errors are returned as `Err`; collaborator
    /// failures come back as `StageResult::Failed` after being recorded.
    pub async fn run_stage<T, F, Fut>(&self, video_id: &str, stage: Stage, mut op: F) -> Result<StageResult<T>>
    where
        T: StageArtifact,
        F: FnMut() -> Fut,
        Fut: Future<Output = CapabilityResult<T>>,
    {
        let mut backoff = self.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.store
                .update_stage(video_id, stage, stage.in_progress(), None, Utc::now())
                .await?;
            debug!("{} {}: attempt {}/{}", video_id, stage, attempt, self.policy.max_attempts);

            let outcome = match tokio::time::timeout(self.policy.attempt_timeout, op()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(CapabilityError::Transient(format!(
                    "attempt timed out after {:?}",
                    self.policy.attempt_timeout
                ))),
            };

            let error = match outcome {
                Ok(artifact) => {
                    // The artifact must be durable before the completed status is.
                    self.store.record_artifact(video_id, stage, &artifact).await?;
                    let result_ref = artifact.result_ref();
                    self.store
                        .update_stage(video_id, stage, stage.completed(), Some(&result_ref), Utc::now())
                        .await?;
                    info!("{} {} completed ({})", video_id, stage, result_ref);
                    return Ok(StageResult::Completed(artifact));
                }
                Err(error) => error,
            };

            let kind = error.kind();
            if kind.is_retryable() && attempt < self.policy.max_attempts {
                let delay = backoff.next_backoff().unwrap_or(self.policy.base_delay);
                warn!(
                    "{} {} attempt {} failed ({}), retrying in {:?}",
                    video_id, stage, attempt, error, delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let failure = StageFailure {
                stage,
                kind,
                message: error.to_string(),
                attempts: attempt,
            };
            self.store
                .update_stage(
                    video_id,
                    stage,
                    VideoStatus::Failed(stage),
                    Some(&failure.result_ref()),
                    Utc::now(),
                )
                .await?;
            warn!(
                "{} {} failed after {} attempt(s) [{}]: {}",
                video_id, stage, attempt, kind, failure.message
            );
            return Ok(StageResult::Failed(failure));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interfaces::ChannelKind;

    #[test]
    fn result_refs_are_short() {
        let long_summary = "word ".repeat(100);
        assert!(long_summary.result_ref().chars().count() <= 83);

        let receipt = DeliveryReceipt {
            delivered: vec![ChannelKind::Discord, ChannelKind::Telegram],
        };
        assert_eq!(receipt.result_ref(), "delivered: discord,telegram");
        assert_eq!(DeliveryReceipt::default().result_ref(), "no targets configured");
    }
}
