use crate::types::{PipelineError, ProcessingRecord, Result, Stage, StageAttempt, VideoStatus};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const SELECT_RECORD: &str = r#"
    SELECT video_id, channel_id, title, first_seen_at, status, last_attempt_at, attempt_count, stage_results
    FROM videos
"#;

/// Durable record of every video ever seen, keyed by `video_id`.
pub struct DedupStore {
    db: SqlitePool,
}

impl DedupStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let db = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { db };
        store.setup_schema().await?;

        info!("Opened dedup store at {}", path.display());
        Ok(store)
    }

    pub async fn setup_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS videos (
                video_id TEXT PRIMARY KEY NOT NULL,
                channel_id TEXT NOT NULL,
                title TEXT NOT NULL,
                first_seen_at TEXT NOT NULL,
                status TEXT NOT NULL CHECK (
                    status IN ('discovered', 'transcribing', 'transcribed', 'summarizing', 'summarized',
                               'extracting_moments', 'moments_extracted', 'notifying', 'done')
                    OR status IN ('failed:transcribe', 'failed:summarize', 'failed:extract_key_moments', 'failed:notify')
                ),
                last_attempt_at TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                stage_results TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_videos_status ON videos (status)")
            .execute(&self.db)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stage_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                video_id TEXT NOT NULL REFERENCES videos (video_id),
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                result_ref TEXT,
                attempted_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS artifacts (
                video_id TEXT NOT NULL REFERENCES videos (video_id),
                stage TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (video_id, stage)
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                video_id TEXT PRIMARY KEY NOT NULL REFERENCES videos (video_id),
                owner TEXT NOT NULL,
                expires_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn exists(&self, video_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM videos WHERE video_id = ?")
            .bind(video_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.is_some())
    }

    pub async fn get(&self, video_id: &str) -> Result<Option<ProcessingRecord>> {
        let row = sqlx::query(&format!("{} WHERE video_id = ?", SELECT_RECORD))
            .bind(video_id)
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Insert a `discovered` record unless one exists. Concurrent callers for
    /// the same id all get back the single stored record.
    pub async fn create_if_absent(
        &self,
        video_id: &str,
        channel_id: &str,
        title: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<ProcessingRecord> {
        let stage_results = serde_json::to_string(&ProcessingRecord::empty_stage_results())?;

        let result = sqlx::query(
            r#"
            INSERT INTO videos (video_id, channel_id, title, first_seen_at, status, last_attempt_at, attempt_count, stage_results)
            VALUES (?, ?, ?, ?, ?, NULL, 0, ?)
            ON CONFLICT (video_id) DO NOTHING
            "#,
        )
        .bind(video_id)
        .bind(channel_id)
        .bind(title)
        .bind(seen_at)
        .bind(VideoStatus::Discovered.as_db_str())
        .bind(stage_results)
        .execute(&self.db)
        .await?;

        if result.rows_affected() > 0 {
            info!("Discovered new video {} on {}", video_id, channel_id);
        } else {
            debug!("Video {} already recorded", video_id);
        }

        self.get(video_id)
            .await?
            .ok_or_else(|| PipelineError::CorruptRecord(format!("record for {} vanished after insert", video_id)))
    }

    /// Record one stage attempt and move the record along the state machine.
    pub async fn update_stage(
        &self,
        video_id: &str,
        stage: Stage,
        status: VideoStatus,
        result_ref: Option<&str>,
        attempted_at: DateTime<Utc>,
    ) -> Result<ProcessingRecord> {
        let current = self.get(video_id).await?.ok_or_else(|| PipelineError::UnknownVideo {
            video_id: video_id.to_string(),
        })?;

        let belongs_to_stage =
            status == stage.in_progress() || status == stage.completed() || status == VideoStatus::Failed(stage);
        if !belongs_to_stage || !current.status.can_advance_to(status) {
            return Err(PipelineError::InvalidTransition {
                video_id: video_id.to_string(),
                from: current.status,
                to: status,
            });
        }

        let mut next = current.clone();
        next.status = status;
        next.last_attempt_at = Some(attempted_at);
        if status == stage.in_progress() {
            next.attempt_count = if current.status == status { current.attempt_count + 1 } else { 1 };
        } else {
            next.stage_results.insert(stage, result_ref.map(str::to_string));
        }

        let mut tx = self.db.begin().await?;

        // Compare-and-set on the status this transition was validated against.
        let updated = sqlx::query(
            r#"
            UPDATE videos
            SET status = ?, last_attempt_at = ?, attempt_count = ?, stage_results = ?
            WHERE video_id = ? AND status = ?
            "#,
        )
        .bind(next.status.as_db_str())
        .bind(attempted_at)
        .bind(next.attempt_count as i64)
        .bind(serde_json::to_string(&next.stage_results)?)
        .bind(video_id)
        .bind(current.status.as_db_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            warn!("Concurrent status change on {} while recording {}", video_id, status);
            let actual = self.get(video_id).await?.map(|r| r.status).unwrap_or(current.status);
            return Err(PipelineError::InvalidTransition {
                video_id: video_id.to_string(),
                from: actual,
                to: status,
            });
        }

        append_attempt(&mut tx, video_id, stage, status, result_ref, attempted_at).await?;
        tx.commit().await?;

        debug!("{} -> {} (attempt {})", video_id, status, next.attempt_count);
        Ok(next)
    }

    /// Explicit re-run: a `failed(stage)` record goes back to that stage's
    /// in-progress status, a `done` record restarts from transcription.
    /// Non-terminal records are returned unchanged.
    pub async fn reset_for_rerun(&self, video_id: &str, requested_at: DateTime<Utc>) -> Result<ProcessingRecord> {
        let current = self.get(video_id).await?.ok_or_else(|| PipelineError::UnknownVideo {
            video_id: video_id.to_string(),
        })?;

        let (stage, mut stage_results) = match current.status {
            VideoStatus::Failed(stage) => {
                let mut results = current.stage_results.clone();
                results.insert(stage, None);
                (stage, results)
            }
            VideoStatus::Done => (Stage::Transcribe, ProcessingRecord::empty_stage_results()),
            _ => return Ok(current),
        };
        // Later stages are recomputed from the reset point.
        let mut later = stage.next();
        while let Some(next_stage) = later {
            stage_results.insert(next_stage, None);
            later = next_stage.next();
        }

        let status = stage.in_progress();
        let mut tx = self.db.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE videos
            SET status = ?, attempt_count = 0, stage_results = ?
            WHERE video_id = ? AND status = ?
            "#,
        )
        .bind(status.as_db_str())
        .bind(serde_json::to_string(&stage_results)?)
        .bind(video_id)
        .bind(current.status.as_db_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(PipelineError::InvalidTransition {
                video_id: video_id.to_string(),
                from: current.status,
                to: status,
            });
        }

        append_attempt(&mut tx, video_id, stage, status, Some("rerun requested"), requested_at).await?;
        tx.commit().await?;

        info!("Reset {} from {} to {} for re-run", video_id, current.status, status);
        Ok(ProcessingRecord {
            status,
            attempt_count: 0,
            stage_results,
            ..current
        })
    }

    /// Claim exclusive rights to drive `video_id` until `now + ttl`. Succeeds
    /// when nobody holds the lease, `owner` already holds it, or the holder's
    /// lease has expired.
    pub async fn acquire_lease(
        &self,
        video_id: &str,
        owner: &str,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now_ms = now.timestamp_millis();
        let expires_at_ms = (now + ttl).timestamp_millis();

        let result = sqlx::query(
            r#"
            INSERT INTO leases (video_id, owner, expires_at_ms)
            VALUES (?, ?, ?)
            ON CONFLICT (video_id) DO UPDATE
            SET owner = excluded.owner, expires_at_ms = excluded.expires_at_ms
            WHERE leases.owner = excluded.owner OR leases.expires_at_ms <= ?
            "#,
        )
        .bind(video_id)
        .bind(owner)
        .bind(expires_at_ms)
        .bind(now_ms)
        .execute(&self.db)
        .await?;

        let acquired = result.rows_affected() > 0;
        if acquired {
            debug!("{} leased to {}", video_id, owner);
        } else {
            debug!("{} is leased by another owner", video_id);
        }
        Ok(acquired)
    }

    /// Drop `owner`'s lease on `video_id`. A lease taken over by someone else
    /// is left alone.
    pub async fn release_lease(&self, video_id: &str, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM leases WHERE video_id = ? AND owner = ?")
            .bind(video_id)
            .bind(owner)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Persist a stage's full output, replacing any earlier one.
    pub async fn record_artifact<T: Serialize>(&self, video_id: &str, stage: Stage, artifact: &T) -> Result<()> {
        let payload = serde_json::to_string(artifact)?;

        sqlx::query(
            r#"
            INSERT INTO artifacts (video_id, stage, payload, recorded_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (video_id, stage)
            DO UPDATE SET payload = excluded.payload, recorded_at = excluded.recorded_at
            "#,
        )
        .bind(video_id)
        .bind(stage.as_str())
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn load_artifact<T: DeserializeOwned>(&self, video_id: &str, stage: Stage) -> Result<Option<T>> {
        let row = sqlx::query("SELECT payload FROM artifacts WHERE video_id = ? AND stage = ?")
            .bind(video_id)
            .bind(stage.as_str())
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => {
                let payload: String = row.try_get("payload")?;
                serde_json::from_str(&payload)
                    .map(Some)
                    .map_err(|e| PipelineError::CorruptRecord(format!("{} artifact for {}: {}", stage, video_id, e)))
            }
            None => Ok(None),
        }
    }

    pub async fn list_by_status(&self, status: VideoStatus) -> Result<Vec<ProcessingRecord>> {
        let rows = sqlx::query(&format!("{} WHERE status = ? ORDER BY first_seen_at, video_id", SELECT_RECORD))
            .bind(status.as_db_str())
            .fetch_all(&self.db)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Every recorded attempt for `video_id`, oldest first.
    pub async fn attempt_history(&self, video_id: &str) -> Result<Vec<StageAttempt>> {
        let rows = sqlx::query(
            "SELECT video_id, stage, status, result_ref, attempted_at FROM stage_attempts WHERE video_id = ? ORDER BY id",
        )
        .bind(video_id)
        .fetch_all(&self.db)
        .await?;

        let mut attempts = Vec::new();
        for row in rows {
            let stage: String = row.try_get("stage")?;
            let status: String = row.try_get("status")?;
            attempts.push(StageAttempt {
                video_id: row.try_get("video_id")?,
                stage: stage.parse()?,
                status: status.parse()?,
                result_ref: row.try_get("result_ref")?,
                attempted_at: row.try_get::<DateTime<Utc>, _>("attempted_at")?,
            });
        }

        Ok(attempts)
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}

async fn append_attempt(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    video_id: &str,
    stage: Stage,
    status: VideoStatus,
    result_ref: Option<&str>,
    attempted_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO stage_attempts (video_id, stage, status, result_ref, attempted_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(video_id)
    .bind(stage.as_str())
    .bind(status.as_db_str())
    .bind(result_ref)
    .bind(attempted_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn record_from_row(row: &SqliteRow) -> Result<ProcessingRecord> {
    let status: String = row.try_get("status")?;
    let stage_results: String = row.try_get("stage_results")?;
    let stage_results: BTreeMap<Stage, Option<String>> = serde_json::from_str(&stage_results)
        .map_err(|e| PipelineError::CorruptRecord(format!("stage_results: {}", e)))?;

    Ok(ProcessingRecord {
        video_id: row.try_get("video_id")?,
        channel_id: row.try_get("channel_id")?,
        title: row.try_get("title")?,
        first_seen_at: row.try_get::<DateTime<Utc>, _>("first_seen_at")?,
        status: status.parse()?,
        last_attempt_at: row.try_get::<Option<DateTime<Utc>>, _>("last_attempt_at")?,
        attempt_count: row.try_get::<i64, _>("attempt_count")? as u32,
        stage_results,
    })
}
