//! Queue-driven AI analysis pipeline.
//!
//! Tasks live in the `tasks` table, which survives restarts; a bounded
//! worker pool claims them one at a time with an atomic
//! `UPDATE ... RETURNING`, so workers never double-claim. Each claimed
//! task runs vision analysis, embeds the resulting description, and
//! commits tags + embedding + index entry as one observable step.
//!
//! Failure handling follows the classification from [`crate::errors`]:
//! retryable failures park the task in `failed_retryable` until its
//! backoff gate passes, then it is claimed again; once the attempt budget
//! is spent (or on a permanent failure) the task goes terminal `failed`
//! and is only visible through status queries — it never stops other
//! fingerprints from processing.
//!
//! Work on the same fingerprint is serialized through a per-fingerprint
//! async mutex shared with the delete path: a delete cannot race the
//! result commit, and a result arriving for a deleted image is discarded.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AnalysisConfig;
use crate::embedding::{vec_to_blob, EmbeddingBackend};
use crate::errors::{AnalysisFailure, EngineError};
use crate::index::{EntryMeta, VectorIndex};
use crate::models::{AnalysisTask, TagSource, TaskState};
use crate::store::ContentStore;
use crate::sync::backoff_secs;
use crate::vision::VisionBackend;

/// Per-fingerprint mutual exclusion, shared between the pipeline's result
/// commit and the engine's delete path.
#[derive(Default)]
pub struct FingerprintLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FingerprintLocks {
    /// Get (or create) the lock for a fingerprint. Entries nobody holds
    /// anymore are dropped on the way in, so the map tracks in-flight
    /// work rather than every fingerprint ever touched.
    pub fn lock_for(&self, fingerprint: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().expect("lock map poisoned");
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(
            map.entry(fingerprint.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

/// Enqueue a new analysis task for a fingerprint. Returns the task id.
pub async fn enqueue(pool: &SqlitePool, fingerprint: &str) -> Result<String, EngineError> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO tasks (id, fingerprint, state, attempts, next_attempt_at, created_at, updated_at)
        VALUES (?, ?, 'queued', 0, 0, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(fingerprint)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(id)
}

/// Requeue tasks left `in_progress` by a previous process. Called once at
/// startup, before workers start.
pub async fn recover_interrupted(pool: &SqlitePool) -> Result<u64, EngineError> {
    let now = Utc::now().timestamp();
    let result = sqlx::query(
        "UPDATE tasks SET state = 'queued', updated_at = ? WHERE state = 'in_progress'",
    )
    .bind(now)
    .execute(pool)
    .await?;
    let n = result.rows_affected();
    if n > 0 {
        info!(recovered = n, "requeued interrupted analysis tasks");
    }
    Ok(n)
}

pub async fn task_by_id(pool: &SqlitePool, id: &str) -> Result<Option<AnalysisTask>, EngineError> {
    let row = sqlx::query(
        r#"
        SELECT id, fingerprint, state, attempts, next_attempt_at, created_at, last_error
        FROM tasks WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| AnalysisTask {
        id: r.get("id"),
        fingerprint: r.get("fingerprint"),
        state: TaskState::parse(r.get::<String, _>("state").as_str()).unwrap_or(TaskState::Failed),
        attempts: r.get("attempts"),
        next_attempt_at: r.get("next_attempt_at"),
        created_at: r.get("created_at"),
        last_error: r.get("last_error"),
    }))
}

pub struct AnalysisPipeline {
    pool: SqlitePool,
    cfg: AnalysisConfig,
    store: Arc<ContentStore>,
    vision: Arc<dyn VisionBackend>,
    embedder: Arc<dyn EmbeddingBackend>,
    index: Arc<RwLock<VectorIndex>>,
    locks: Arc<FingerprintLocks>,
}

impl AnalysisPipeline {
    pub fn new(
        pool: SqlitePool,
        cfg: AnalysisConfig,
        store: Arc<ContentStore>,
        vision: Arc<dyn VisionBackend>,
        embedder: Arc<dyn EmbeddingBackend>,
        index: Arc<RwLock<VectorIndex>>,
        locks: Arc<FingerprintLocks>,
    ) -> Self {
        Self {
            pool,
            cfg,
            store,
            vision,
            embedder,
            index,
            locks,
        }
    }

    /// Drain the queue with the configured number of workers. Returns when
    /// no task is eligible; tasks parked behind a future backoff gate are
    /// left for the next run.
    pub async fn drain(self: &Arc<Self>) -> Result<(), EngineError> {
        let mut handles = Vec::new();
        for worker_id in 0..self.cfg.workers {
            let pipeline = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                loop {
                    match pipeline.claim_next().await {
                        Ok(Some(task)) => {
                            debug!(worker = worker_id, task = %task.id, "claimed task");
                            pipeline.process(task).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(worker = worker_id, error = %e, "claim failed");
                            break;
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.map_err(|e| anyhow::anyhow!(e))?;
        }
        Ok(())
    }

    /// Atomically claim the oldest eligible task.
    async fn claim_next(&self) -> Result<Option<AnalysisTask>, EngineError> {
        let now = Utc::now().timestamp();
        let row = sqlx::query(
            r#"
            UPDATE tasks SET state = 'in_progress', updated_at = ?
            WHERE id = (
                SELECT id FROM tasks
                WHERE state IN ('queued', 'failed_retryable') AND next_attempt_at <= ?
                ORDER BY created_at
                LIMIT 1
            )
            RETURNING id, fingerprint, state, attempts, next_attempt_at, created_at, last_error
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| AnalysisTask {
            id: r.get("id"),
            fingerprint: r.get("fingerprint"),
            state: TaskState::InProgress,
            attempts: r.get("attempts"),
            next_attempt_at: r.get("next_attempt_at"),
            created_at: r.get("created_at"),
            last_error: r.get("last_error"),
        }))
    }

    /// Run one claimed task to a terminal or requeued state. Never returns
    /// an error: failures are recorded on the task row.
    async fn process(&self, task: AnalysisTask) {
        match self.analyze_and_commit(&task).await {
            Ok(true) => {
                if let Err(e) = self.mark(&task.id, TaskState::Succeeded, None).await {
                    warn!(task = %task.id, error = %e, "could not mark task succeeded");
                }
            }
            Ok(false) => {
                // Image vanished while we were working; result discarded
                let msg = "image deleted during analysis; result discarded";
                if let Err(e) = self.mark(&task.id, TaskState::Failed, Some(msg)).await {
                    warn!(task = %task.id, error = %e, "could not mark task discarded");
                }
            }
            Err(failure) => {
                if let Err(e) = self.record_failure(&task, &failure).await {
                    warn!(task = %task.id, error = %e, "could not record task failure");
                }
            }
        }
    }

    /// The analysis body. `Ok(false)` means the image was deleted while the
    /// task was in flight and nothing was written.
    async fn analyze_and_commit(&self, task: &AnalysisTask) -> Result<bool, AnalysisFailure> {
        let image = self
            .store
            .image(&task.fingerprint)
            .await
            .map_err(|e| AnalysisFailure::Retryable(format!("catalog read failed: {}", e)))?;
        let image = match image {
            Some(img) => img,
            None => return Ok(false),
        };

        let bytes = match self.store.get(&task.fingerprint, None).await {
            Ok(bytes) => bytes,
            Err(EngineError::NotFound { .. }) => return Ok(false),
            Err(e) => {
                return Err(AnalysisFailure::Retryable(format!(
                    "object read failed: {}",
                    e
                )))
            }
        };

        // Both external calls happen outside the fingerprint lock; only
        // the commit needs exclusion
        let output = self.vision.analyze(&bytes, &image.mime).await?;
        let vectors = self.embedder.embed(&[output.description.clone()]).await?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| AnalysisFailure::Permanent("empty embedding response".to_string()))?;

        let lock = self.locks.lock_for(&task.fingerprint);
        let _guard = lock.lock().await;

        // Recheck under the lock: a delete may have won the race
        let still_there = self
            .store
            .image(&task.fingerprint)
            .await
            .map_err(|e| AnalysisFailure::Retryable(format!("catalog read failed: {}", e)))?;
        if still_there.is_none() {
            return Ok(false);
        }

        self.commit_result(&task.fingerprint, &image.mime, &output, &vector)
            .await
            .map_err(|e| AnalysisFailure::Retryable(format!("result commit failed: {}", e)))?;

        Ok(true)
    }

    /// Write tags, description, and embedding in one transaction, then
    /// upsert the index entry. AI tags are replaced wholesale; user tags
    /// are untouched. The old vector is superseded, never duplicated.
    async fn commit_result(
        &self,
        fingerprint: &str,
        mime: &str,
        output: &crate::models::VisionOutput,
        vector: &[f32],
    ) -> anyhow::Result<()> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM tags WHERE fingerprint = ? AND source = 'ai'")
            .bind(fingerprint)
            .execute(&mut *tx)
            .await?;

        for (label, confidence) in &output.tags {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO tags (fingerprint, label, source, confidence, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(fingerprint)
            .bind(label)
            .bind(TagSource::Ai.as_str())
            .bind(*confidence)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE images SET description = ? WHERE fingerprint = ?")
            .bind(&output.description)
            .bind(fingerprint)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO embeddings (fingerprint, model, dims, vector, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                vector = excluded.vector,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(fingerprint)
        .bind(self.embedder.model_name())
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // All tag labels (ai + user) for the filter snapshot
        let labels: Vec<String> =
            sqlx::query_scalar("SELECT label FROM tags WHERE fingerprint = ?")
                .bind(fingerprint)
                .fetch_all(&mut *tx)
                .await?;

        tx.commit().await?;

        let meta = EntryMeta {
            mime: mime.to_string(),
            tags: labels,
        };
        self.index
            .write()
            .expect("index lock poisoned")
            .upsert(fingerprint, vector.to_vec(), meta)?;

        Ok(())
    }

    async fn mark(
        &self,
        task_id: &str,
        state: TaskState,
        error: Option<&str>,
    ) -> Result<(), EngineError> {
        let now = Utc::now().timestamp();
        sqlx::query("UPDATE tasks SET state = ?, updated_at = ?, last_error = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(now)
            .bind(error)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Apply the retry policy to a failed task.
    async fn record_failure(
        &self,
        task: &AnalysisTask,
        failure: &AnalysisFailure,
    ) -> Result<(), EngineError> {
        let now = Utc::now().timestamp();
        let attempts = task.attempts + 1;

        let (state, next_attempt_at) = if failure.is_retryable() && attempts < self.cfg.max_attempts
        {
            let delay = backoff_secs(
                self.cfg.backoff_base_secs,
                self.cfg.backoff_cap_secs,
                attempts,
            );
            (TaskState::FailedRetryable, now + delay as i64)
        } else {
            if failure.is_retryable() {
                warn!(task = %task.id, fingerprint = %task.fingerprint,
                      "retry budget exhausted after {} attempts", attempts);
            }
            (TaskState::Failed, now)
        };

        debug!(task = %task.id, state = state.as_str(), error = %failure, "task failed");

        sqlx::query(
            r#"
            UPDATE tasks
            SET state = ?, attempts = ?, next_attempt_at = ?, updated_at = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(now)
        .bind(failure.to_string())
        .bind(&task.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unheld_fingerprint_locks_are_evicted() {
        let locks = FingerprintLocks::default();
        let held = locks.lock_for("held");
        drop(locks.lock_for("released"));

        // Next lookup sweeps entries with no outside holder
        let _other = locks.lock_for("other");

        let map = locks.inner.lock().unwrap();
        assert!(map.contains_key("held"));
        assert!(map.contains_key("other"));
        assert!(!map.contains_key("released"));
        drop(held);
    }

    #[test]
    fn test_lock_for_same_fingerprint_is_shared() {
        let locks = FingerprintLocks::default();
        let a = locks.lock_for("fp");
        let b = locks.lock_for("fp");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
