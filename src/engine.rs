//! Top-level orchestrator wiring storage, analysis, and search together.
//!
//! An [`Engine`] owns the catalog pool, the endpoint set, the synchronizer,
//! the vector index, and (when vision and embedding are configured) the
//! analysis pipeline. Construction from config goes through
//! [`Engine::open`]; tests assemble one from injected backends with
//! [`Engine::assemble`].
//!
//! Deletion order is fixed: index entry first, then catalog metadata, then
//! endpoint bytes. A fingerprint therefore disappears from search results
//! before its object is gone, and a partial endpoint failure leaves the
//! catalog row in place so the delete can be retried.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::embedding::{self, blob_to_vec, EmbeddingBackend, Metric};
use crate::endpoint::EndpointSet;
use crate::errors::EngineError;
use crate::index::{EntryMeta, SearchFilters, VectorIndex};
use crate::migrate;
use crate::models::{AnalysisTask, ImageObject, TagAssignment, TagSource};
use crate::pipeline::{self, AnalysisPipeline, FingerprintLocks};
use crate::store::ContentStore;
use crate::sync::{EndpointHealth, SyncReport, Synchronizer};
use crate::vision::{OpenAiVision, VisionBackend};

/// Result of an ingest call.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub fingerprint: String,
    pub mime: String,
    pub size_bytes: i64,
    /// True when identical bytes were already cataloged and nothing was
    /// stored or enqueued.
    pub deduplicated: bool,
    /// The analysis task covering this content. For a dedup hit this is
    /// the most recent existing task, if any.
    pub task_id: Option<String>,
}

/// One semantic search result.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    pub fingerprint: String,
    pub score: f32,
    pub description: Option<String>,
}

/// Everything known about one image, for status and detail output.
#[derive(Debug, Clone)]
pub struct ImageDetail {
    pub image: ImageObject,
    pub tags: Vec<TagAssignment>,
    pub indexed: bool,
}

/// Task counts per state, for queue status output.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct QueueStatus {
    pub queued: i64,
    pub in_progress: i64,
    pub succeeded: i64,
    pub failed_retryable: i64,
    pub failed: i64,
}

struct AnalysisHandles {
    pipeline: Arc<AnalysisPipeline>,
    embedder: Arc<dyn EmbeddingBackend>,
}

pub struct Engine {
    pool: SqlitePool,
    store: Arc<ContentStore>,
    synchronizer: Synchronizer,
    index: Arc<RwLock<VectorIndex>>,
    locks: Arc<FingerprintLocks>,
    analysis: Option<AnalysisHandles>,
}

impl Engine {
    /// Open an engine from configuration: connect the catalog, run
    /// migrations, resolve endpoints, construct the configured AI backends,
    /// requeue interrupted tasks, and load the vector index.
    pub async fn open(config: &Config) -> Result<Engine, EngineError> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;

        let endpoints = Arc::new(EndpointSet::from_config(config)?);

        let vision: Option<Arc<dyn VisionBackend>> =
            if config.vision.endpoint.is_some() && config.vision.model.is_some() {
                Some(Arc::new(OpenAiVision::new(&config.vision)?))
            } else {
                None
            };

        let embedder: Option<Arc<dyn EmbeddingBackend>> = if config.embedding.is_enabled() {
            Some(Arc::from(embedding::create_backend(&config.embedding)?))
        } else {
            None
        };

        Self::assemble(pool, config, endpoints, vision, embedder).await
    }

    /// Assemble an engine from already-built parts. Analysis is available
    /// only when both a vision and an embedding backend are supplied.
    pub async fn assemble(
        pool: SqlitePool,
        config: &Config,
        endpoints: Arc<EndpointSet>,
        vision: Option<Arc<dyn VisionBackend>>,
        embedder: Option<Arc<dyn EmbeddingBackend>>,
    ) -> Result<Engine, EngineError> {
        let store = Arc::new(ContentStore::new(pool.clone(), Arc::clone(&endpoints)));
        let synchronizer =
            Synchronizer::new(pool.clone(), Arc::clone(&endpoints), config.sync.clone());

        let metric = Metric::parse(&config.embedding.metric).unwrap_or(Metric::Cosine);
        let dims = embedder
            .as_ref()
            .map(|e| e.dims())
            .or(config.embedding.dims)
            .unwrap_or(0);
        let index = Arc::new(RwLock::new(VectorIndex::new(dims, metric)));
        let locks = Arc::new(FingerprintLocks::default());

        pipeline::recover_interrupted(&pool).await?;

        let analysis = match (vision, embedder) {
            (Some(vision), Some(embedder)) => {
                let pipeline = Arc::new(AnalysisPipeline::new(
                    pool.clone(),
                    config.analysis.clone(),
                    Arc::clone(&store),
                    vision,
                    Arc::clone(&embedder),
                    Arc::clone(&index),
                    Arc::clone(&locks),
                ));
                Some(AnalysisHandles { pipeline, embedder })
            }
            _ => None,
        };

        let engine = Engine {
            pool,
            store,
            synchronizer,
            index,
            locks,
            analysis,
        };
        engine.load_index().await?;
        Ok(engine)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    fn analysis(&self) -> Result<&AnalysisHandles, EngineError> {
        self.analysis.as_ref().ok_or_else(|| {
            EngineError::Other(anyhow::anyhow!(
                "analysis requires vision and embedding backends to be configured"
            ))
        })
    }

    /// Ingest image bytes: store, catalog, and enqueue analysis. Identical
    /// bytes short-circuit to the existing fingerprint and its most recent
    /// task; no duplicate object or task is created.
    pub async fn ingest(&self, bytes: &[u8]) -> Result<IngestOutcome, EngineError> {
        let outcome = self.store.put(bytes).await?;

        let task_id = if outcome.deduplicated {
            sqlx::query_scalar(
                "SELECT id FROM tasks WHERE fingerprint = ? ORDER BY created_at DESC LIMIT 1",
            )
            .bind(&outcome.fingerprint)
            .fetch_optional(&self.pool)
            .await?
        } else {
            Some(pipeline::enqueue(&self.pool, &outcome.fingerprint).await?)
        };

        info!(
            fingerprint = %outcome.fingerprint,
            deduplicated = outcome.deduplicated,
            "ingested {} bytes", outcome.size_bytes
        );

        Ok(IngestOutcome {
            fingerprint: outcome.fingerprint,
            mime: outcome.mime,
            size_bytes: outcome.size_bytes,
            deduplicated: outcome.deduplicated,
            task_id,
        })
    }

    pub async fn task_status(&self, task_id: &str) -> Result<AnalysisTask, EngineError> {
        pipeline::task_by_id(&self.pool, task_id)
            .await?
            .ok_or_else(|| EngineError::UnknownTask(task_id.to_string()))
    }

    /// Queue a fresh analysis for an already-cataloged image.
    pub async fn reanalyze(&self, fingerprint: &str) -> Result<String, EngineError> {
        if self.store.image(fingerprint).await?.is_none() {
            return Err(EngineError::NotFound {
                fingerprint: fingerprint.to_string(),
            });
        }
        pipeline::enqueue(&self.pool, fingerprint).await
    }

    /// Drain the analysis queue with the configured worker pool.
    pub async fn run_workers(&self) -> Result<(), EngineError> {
        let handles = self.analysis()?;
        handles.pipeline.drain().await
    }

    /// Embed the query text and rank it against the index.
    pub async fn search_text(
        &self,
        query: &str,
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let handles = self.analysis()?;
        let vectors = handles
            .embedder
            .embed(&[query.to_string()])
            .await
            .map_err(|e| anyhow::anyhow!("query embedding failed: {}", e))?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty embedding response"))?;
        self.search_vector(&vector, k, filters).await
    }

    /// Rank a pre-computed query vector against the index.
    pub async fn search_vector(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let ranked = {
            let index = self.index.read().expect("index lock poisoned");
            index.search(query, k, filters)?
        };

        let mut hits = Vec::with_capacity(ranked.len());
        for (fingerprint, score) in ranked {
            let description = self
                .store
                .image(&fingerprint)
                .await?
                .and_then(|img| img.description);
            hits.push(SearchHit {
                fingerprint,
                score,
                description,
            });
        }
        Ok(hits)
    }

    /// Remove an image everywhere: index entry, tags, embedding, task
    /// backlog, then object bytes. Serialized with in-flight analysis of
    /// the same fingerprint so a late result cannot resurrect it.
    pub async fn delete(&self, fingerprint: &str) -> Result<(), EngineError> {
        let lock = self.locks.lock_for(fingerprint);
        let _guard = lock.lock().await;

        if self.store.image(fingerprint).await?.is_none() {
            return Err(EngineError::NotFound {
                fingerprint: fingerprint.to_string(),
            });
        }

        self.index
            .write()
            .expect("index lock poisoned")
            .remove(fingerprint);

        sqlx::query("DELETE FROM tags WHERE fingerprint = ?")
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM embeddings WHERE fingerprint = ?")
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;

        // Pending work for a deleted image is pointless
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE tasks SET state = 'failed', last_error = 'image deleted', updated_at = ?
            WHERE fingerprint = ? AND state IN ('queued', 'failed_retryable')
            "#,
        )
        .bind(now)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;

        self.store.delete_bytes(fingerprint).await
    }

    /// Attach a user tag. User tags survive re-analysis.
    pub async fn add_tag(&self, fingerprint: &str, label: &str) -> Result<(), EngineError> {
        if self.store.image(fingerprint).await?.is_none() {
            return Err(EngineError::NotFound {
                fingerprint: fingerprint.to_string(),
            });
        }
        let label = label.trim().to_lowercase();
        if label.is_empty() {
            return Err(EngineError::Other(anyhow::anyhow!("empty tag label")));
        }
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO tags (fingerprint, label, source, confidence, created_at)
            VALUES (?, ?, 'user', NULL, ?)
            "#,
        )
        .bind(fingerprint)
        .bind(&label)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        self.refresh_index_meta(fingerprint).await?;
        Ok(())
    }

    /// Remove a tag. With `source` set only that source's tag goes;
    /// otherwise the label is removed regardless of who created it.
    pub async fn remove_tag(
        &self,
        fingerprint: &str,
        label: &str,
        source: Option<TagSource>,
    ) -> Result<(), EngineError> {
        let label = label.trim().to_lowercase();
        match source {
            Some(src) => {
                sqlx::query("DELETE FROM tags WHERE fingerprint = ? AND label = ? AND source = ?")
                    .bind(fingerprint)
                    .bind(&label)
                    .bind(src.as_str())
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query("DELETE FROM tags WHERE fingerprint = ? AND label = ?")
                    .bind(fingerprint)
                    .bind(&label)
                    .execute(&self.pool)
                    .await?;
            }
        }
        self.refresh_index_meta(fingerprint).await?;
        Ok(())
    }

    pub async fn tags(&self, fingerprint: &str) -> Result<Vec<TagAssignment>, EngineError> {
        let rows = sqlx::query(
            "SELECT fingerprint, label, source, confidence FROM tags WHERE fingerprint = ? ORDER BY source, label",
        )
        .bind(fingerprint)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| TagAssignment {
                fingerprint: r.get("fingerprint"),
                label: r.get("label"),
                source: r.get("source"),
                confidence: r.get("confidence"),
            })
            .collect())
    }

    pub async fn image_detail(&self, fingerprint: &str) -> Result<ImageDetail, EngineError> {
        let image = self
            .store
            .image(fingerprint)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                fingerprint: fingerprint.to_string(),
            })?;
        let tags = self.tags(fingerprint).await?;
        let indexed = self
            .index
            .read()
            .expect("index lock poisoned")
            .contains(fingerprint);
        Ok(ImageDetail {
            image,
            tags,
            indexed,
        })
    }

    pub async fn sync_pass(&self) -> Result<SyncReport, EngineError> {
        self.synchronizer.run_pass().await
    }

    pub async fn reconcile(&self) -> Result<SyncReport, EngineError> {
        self.synchronizer.reconcile().await
    }

    pub async fn storage_health(&self) -> Result<Vec<EndpointHealth>, EngineError> {
        self.synchronizer.storage_health().await
    }

    pub async fn queue_status(&self) -> Result<QueueStatus, EngineError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM tasks GROUP BY state")
            .fetch_all(&self.pool)
            .await?;
        let mut status = QueueStatus::default();
        for row in rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            match state.as_str() {
                "queued" => status.queued = n,
                "in_progress" => status.in_progress = n,
                "succeeded" => status.succeeded = n,
                "failed_retryable" => status.failed_retryable = n,
                "failed" => status.failed = n,
                _ => {}
            }
        }
        Ok(status)
    }

    pub fn index_size(&self) -> usize {
        self.index.read().expect("index lock poisoned").len()
    }

    /// Rebuild the in-memory index from the embeddings table. Vectors whose
    /// dimensionality does not match the configured backend are skipped
    /// with a warning; a reanalyze pass regenerates them.
    pub async fn load_index(&self) -> Result<usize, EngineError> {
        let expected = self.index.read().expect("index lock poisoned").dims();
        if expected == 0 {
            return Ok(0);
        }

        let rows = sqlx::query(
            r#"
            SELECT e.fingerprint, e.dims, e.vector, i.mime
            FROM embeddings e JOIN images i ON i.fingerprint = e.fingerprint
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut loaded = 0usize;
        for row in rows {
            let fingerprint: String = row.get("fingerprint");
            let dims: i64 = row.get("dims");
            if dims as usize != expected {
                warn!(fingerprint = %fingerprint, dims, expected,
                      "stale embedding dimensionality, skipping; reanalyze to regenerate");
                continue;
            }
            let vector = blob_to_vec(row.get::<Vec<u8>, _>("vector").as_slice());
            let mime: String = row.get("mime");
            let labels: Vec<String> =
                sqlx::query_scalar("SELECT label FROM tags WHERE fingerprint = ?")
                    .bind(&fingerprint)
                    .fetch_all(&self.pool)
                    .await?;
            self.index.write().expect("index lock poisoned").upsert(
                &fingerprint,
                vector,
                EntryMeta { mime, tags: labels },
            )?;
            loaded += 1;
        }

        if loaded > 0 {
            info!(entries = loaded, "vector index loaded");
        }
        Ok(loaded)
    }

    async fn refresh_index_meta(&self, fingerprint: &str) -> Result<(), EngineError> {
        let image = match self.store.image(fingerprint).await? {
            Some(img) => img,
            None => return Ok(()),
        };
        let labels: Vec<String> =
            sqlx::query_scalar("SELECT label FROM tags WHERE fingerprint = ?")
                .bind(fingerprint)
                .fetch_all(&self.pool)
                .await?;
        self.index
            .write()
            .expect("index lock poisoned")
            .update_meta(
                fingerprint,
                EntryMeta {
                    mime: image.mime,
                    tags: labels,
                },
            );
        Ok(())
    }
}
