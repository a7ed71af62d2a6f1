//! Content-addressed store over the configured endpoints.
//!
//! Identity is the SHA-256 of the bytes. A put writes synchronously to the
//! primary endpoint only; backups are brought up to date by the
//! synchronizer, driven by the replica rows created here. Identical bytes
//! are never stored twice.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::warn;

use crate::endpoint::EndpointSet;
use crate::errors::EngineError;
use crate::models::{ImageObject, ReplicaState};

/// Hex-encoded SHA-256 content fingerprint.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Result of a put: the fingerprint plus whether this was a dedup no-op.
#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub fingerprint: String,
    pub mime: String,
    pub size_bytes: i64,
    pub deduplicated: bool,
}

pub struct ContentStore {
    pool: SqlitePool,
    endpoints: Arc<EndpointSet>,
}

impl ContentStore {
    pub fn new(pool: SqlitePool, endpoints: Arc<EndpointSet>) -> Self {
        Self { pool, endpoints }
    }

    pub fn endpoints(&self) -> &Arc<EndpointSet> {
        &self.endpoints
    }

    /// Store image bytes. Rejects non-image payloads, deduplicates on
    /// fingerprint, writes to the primary endpoint, and records one
    /// replica row per configured endpoint (`synced` for the primary,
    /// `pending` for backups).
    pub async fn put(&self, bytes: &[u8]) -> Result<PutOutcome, EngineError> {
        let kind = infer::get(bytes).ok_or_else(|| {
            EngineError::UnsupportedFormat("could not detect file type".to_string())
        })?;
        let mime = kind.mime_type().to_string();
        if !mime.starts_with("image/") {
            return Err(EngineError::UnsupportedFormat(mime));
        }

        let fp = fingerprint(bytes);
        let now = Utc::now().timestamp();

        let existing: Option<String> =
            sqlx::query_scalar("SELECT fingerprint FROM images WHERE fingerprint = ?")
                .bind(&fp)
                .fetch_optional(&self.pool)
                .await?;
        if existing.is_some() {
            return Ok(PutOutcome {
                fingerprint: fp,
                mime,
                size_bytes: bytes.len() as i64,
                deduplicated: true,
            });
        }

        let primary = self.endpoints.primary();
        primary
            .put(&fp, bytes)
            .await
            .map_err(|e| EngineError::EndpointUnavailable {
                endpoint: primary.name().to_string(),
                reason: e.to_string(),
            })?;

        sqlx::query(
            "INSERT OR IGNORE INTO images (fingerprint, size_bytes, mime, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&fp)
        .bind(bytes.len() as i64)
        .bind(&mime)
        .bind(now)
        .execute(&self.pool)
        .await?;

        for name in self.endpoints.names() {
            let state = if name == self.endpoints.primary_name {
                ReplicaState::Synced
            } else {
                ReplicaState::Pending
            };
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO replicas (fingerprint, endpoint, state, attempts, next_attempt_at, last_attempt_at)
                VALUES (?, ?, ?, 0, 0, ?)
                "#,
            )
            .bind(&fp)
            .bind(&name)
            .bind(state.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?;
        }

        Ok(PutOutcome {
            fingerprint: fp,
            mime,
            size_bytes: bytes.len() as i64,
            deduplicated: false,
        })
    }

    /// Fetch object bytes. With `endpoint` set, only that endpoint is
    /// consulted; otherwise primary first, then backups in configured
    /// order.
    pub async fn get(
        &self,
        fingerprint: &str,
        endpoint: Option<&str>,
    ) -> Result<Vec<u8>, EngineError> {
        if let Some(name) = endpoint {
            let backend =
                self.endpoints
                    .by_name
                    .get(name)
                    .ok_or_else(|| EngineError::EndpointUnavailable {
                        endpoint: name.to_string(),
                        reason: "not configured".to_string(),
                    })?;
            return match backend.get(fingerprint).await {
                Ok(Some(bytes)) => Ok(bytes),
                Ok(None) => Err(EngineError::NotFound {
                    fingerprint: fingerprint.to_string(),
                }),
                Err(e) => Err(EngineError::EndpointUnavailable {
                    endpoint: name.to_string(),
                    reason: e.to_string(),
                }),
            };
        }

        for backend in &self.endpoints.ordered {
            match backend.get(fingerprint).await {
                Ok(Some(bytes)) => return Ok(bytes),
                Ok(None) => continue,
                Err(e) => {
                    // An unreachable endpoint must not mask a copy elsewhere
                    warn!(endpoint = backend.name(), error = %e, "get fell through to next endpoint");
                    continue;
                }
            }
        }

        Err(EngineError::NotFound {
            fingerprint: fingerprint.to_string(),
        })
    }

    /// Remove the object's bytes from every endpoint. Replica rows for
    /// endpoints that succeed are deleted; rows for failures stay (with
    /// the error recorded) so a retried delete converges. The catalog row
    /// is removed only once no endpoint holds the bytes.
    pub async fn delete_bytes(&self, fingerprint: &str) -> Result<(), EngineError> {
        let known: Option<String> =
            sqlx::query_scalar("SELECT fingerprint FROM images WHERE fingerprint = ?")
                .bind(fingerprint)
                .fetch_optional(&self.pool)
                .await?;
        if known.is_none() {
            return Err(EngineError::NotFound {
                fingerprint: fingerprint.to_string(),
            });
        }

        let now = Utc::now().timestamp();
        let mut failed: Vec<String> = Vec::new();

        for backend in &self.endpoints.ordered {
            match backend.delete(fingerprint).await {
                Ok(()) => {
                    sqlx::query("DELETE FROM replicas WHERE fingerprint = ? AND endpoint = ?")
                        .bind(fingerprint)
                        .bind(backend.name())
                        .execute(&self.pool)
                        .await?;
                }
                Err(e) => {
                    warn!(endpoint = backend.name(), error = %e, "endpoint delete failed");
                    sqlx::query(
                        r#"
                        UPDATE replicas SET last_error = ?, last_attempt_at = ?
                        WHERE fingerprint = ? AND endpoint = ?
                        "#,
                    )
                    .bind(e.to_string())
                    .bind(now)
                    .bind(fingerprint)
                    .bind(backend.name())
                    .execute(&self.pool)
                    .await?;
                    failed.push(backend.name().to_string());
                }
            }
        }

        if !failed.is_empty() {
            return Err(EngineError::PartialDelete {
                fingerprint: fingerprint.to_string(),
                failed,
            });
        }

        // Rows left by endpoints since removed from configuration would
        // otherwise outlive the catalog row
        sqlx::query("DELETE FROM replicas WHERE fingerprint = ?")
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;

        sqlx::query("DELETE FROM images WHERE fingerprint = ?")
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn image(&self, fingerprint: &str) -> Result<Option<ImageObject>, EngineError> {
        use sqlx::Row;
        let row = sqlx::query(
            "SELECT fingerprint, size_bytes, mime, created_at, description FROM images WHERE fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ImageObject {
            fingerprint: r.get("fingerprint"),
            size_bytes: r.get("size_bytes"),
            mime: r.get("mime"),
            created_at: r.get("created_at"),
            description: r.get("description"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = fingerprint(b"same bytes");
        let b = fingerprint(b"same bytes");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, fingerprint(b"other bytes"));
    }

    #[test]
    fn test_fingerprint_matches_known_sha256() {
        // sha256("") is a well-known constant
        assert_eq!(
            fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
