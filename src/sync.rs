//! Endpoint synchronizer.
//!
//! Drives `pending` replica rows to `synced` by copying objects from an
//! endpoint that holds them (primary preferred) to the one that does not,
//! with capped exponential backoff between attempts. A row that exhausts
//! its attempt budget goes terminal `failed` and is surfaced through
//! [`Synchronizer::storage_health`]; it never blocks ingestion.
//!
//! The reconciliation pass lists every endpoint and repairs drift: missing
//! replica rows are created, rows claiming `synced` for objects an endpoint
//! lost are flipped back to `pending`, terminal failures are re-armed (the
//! endpoint may have recovered), and objects already present are marked
//! `synced` without copying. Fingerprint equality is the only correctness
//! check; objects an endpoint holds that the catalog does not know are
//! logged and left alone.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::endpoint::EndpointSet;
use crate::errors::EngineError;
use crate::models::ReplicaState;

/// Counts from one synchronizer pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncReport {
    pub synced: u64,
    pub deferred: u64,
    pub failed: u64,
}

/// Per-endpoint replica state counts.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub synced: i64,
    pub pending: i64,
    pub failed: i64,
}

/// Backoff before attempt `attempts + 1`: `base * 2^attempts`, capped.
pub fn backoff_secs(base: u64, cap: u64, attempts: i64) -> u64 {
    let shift = attempts.clamp(0, 32) as u32;
    base.saturating_mul(1u64 << shift.min(20)).min(cap)
}

pub struct Synchronizer {
    pool: SqlitePool,
    endpoints: Arc<EndpointSet>,
    cfg: SyncConfig,
}

impl Synchronizer {
    pub fn new(pool: SqlitePool, endpoints: Arc<EndpointSet>, cfg: SyncConfig) -> Self {
        Self {
            pool,
            endpoints,
            cfg,
        }
    }

    /// Attempt every eligible pending replica once. Safe to call from a
    /// timer or on demand; each call is one pass, not a loop.
    pub async fn run_pass(&self) -> Result<SyncReport, EngineError> {
        let now = Utc::now().timestamp();
        let mut report = SyncReport::default();

        let rows = sqlx::query(
            r#"
            SELECT fingerprint, endpoint, attempts FROM replicas
            WHERE state = 'pending' AND next_attempt_at <= ?
            ORDER BY next_attempt_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let fp: String = row.get("fingerprint");
            let endpoint: String = row.get("endpoint");
            let attempts: i64 = row.get("attempts");

            match self.replicate_one(&fp, &endpoint).await {
                Ok(()) => {
                    sqlx::query(
                        r#"
                        UPDATE replicas SET state = 'synced', last_error = NULL, last_attempt_at = ?
                        WHERE fingerprint = ? AND endpoint = ?
                        "#,
                    )
                    .bind(now)
                    .bind(&fp)
                    .bind(&endpoint)
                    .execute(&self.pool)
                    .await?;
                    report.synced += 1;
                }
                Err(e) => {
                    let attempts = attempts + 1;
                    let terminal = attempts >= self.cfg.max_attempts;
                    let state = if terminal {
                        ReplicaState::Failed
                    } else {
                        ReplicaState::Pending
                    };
                    let delay = backoff_secs(
                        self.cfg.backoff_base_secs,
                        self.cfg.backoff_cap_secs,
                        attempts,
                    );
                    if terminal {
                        warn!(fingerprint = %fp, endpoint = %endpoint, error = %e,
                              "replica failed terminally after {} attempts", attempts);
                        report.failed += 1;
                    } else {
                        debug!(fingerprint = %fp, endpoint = %endpoint, error = %e,
                               "replica attempt failed, retrying in {}s", delay);
                        report.deferred += 1;
                    }
                    sqlx::query(
                        r#"
                        UPDATE replicas
                        SET state = ?, attempts = ?, next_attempt_at = ?, last_attempt_at = ?, last_error = ?
                        WHERE fingerprint = ? AND endpoint = ?
                        "#,
                    )
                    .bind(state.as_str())
                    .bind(attempts)
                    .bind(now + delay as i64)
                    .bind(now)
                    .bind(e.to_string())
                    .bind(&fp)
                    .bind(&endpoint)
                    .execute(&self.pool)
                    .await?;
                }
            }
        }

        Ok(report)
    }

    /// Copy one object to `target_name` from the first endpoint that holds
    /// it, primary first. A copy already present counts as success.
    async fn replicate_one(&self, fingerprint: &str, target_name: &str) -> anyhow::Result<()> {
        let target = self
            .endpoints
            .by_name
            .get(target_name)
            .ok_or_else(|| anyhow::anyhow!("endpoint '{}' not configured", target_name))?;

        if target.exists(fingerprint).await.unwrap_or(false) {
            return Ok(());
        }

        for source in &self.endpoints.ordered {
            if source.name() == target_name {
                continue;
            }
            match source.get(fingerprint).await {
                Ok(Some(bytes)) => {
                    target.put(fingerprint, &bytes).await?;
                    return Ok(());
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(source = source.name(), error = %e, "source read failed, trying next");
                    continue;
                }
            }
        }

        anyhow::bail!("no endpoint holds {}", fingerprint)
    }

    /// Periodic drift repair. Idempotent and safe to run concurrently with
    /// ingestion: row creation uses `INSERT OR IGNORE` on the
    /// (fingerprint, endpoint) primary key.
    pub async fn reconcile(&self) -> Result<SyncReport, EngineError> {
        let now = Utc::now().timestamp();
        let mut report = SyncReport::default();

        let catalog: Vec<String> = sqlx::query_scalar("SELECT fingerprint FROM images")
            .fetch_all(&self.pool)
            .await?;
        let catalog: HashSet<String> = catalog.into_iter().collect();

        for backend in &self.endpoints.ordered {
            let held: HashSet<String> = match backend.list().await {
                Ok(listing) => listing.into_iter().collect(),
                Err(e) => {
                    warn!(endpoint = backend.name(), error = %e, "listing failed, skipping endpoint");
                    continue;
                }
            };

            for orphan in held.difference(&catalog) {
                warn!(endpoint = backend.name(), fingerprint = %orphan,
                      "orphan object not in catalog, leaving in place");
            }

            for fp in &catalog {
                // Ensure a row exists for every (image, endpoint) pair
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO replicas (fingerprint, endpoint, state, attempts, next_attempt_at)
                    VALUES (?, ?, 'pending', 0, 0)
                    "#,
                )
                .bind(fp)
                .bind(backend.name())
                .execute(&self.pool)
                .await?;

                if held.contains(fp) {
                    sqlx::query(
                        r#"
                        UPDATE replicas SET state = 'synced', last_error = NULL
                        WHERE fingerprint = ? AND endpoint = ? AND state != 'synced'
                        "#,
                    )
                    .bind(fp)
                    .bind(backend.name())
                    .execute(&self.pool)
                    .await?;
                } else {
                    // Re-arm drifted and terminally failed rows; the
                    // endpoint may have lost the object or recovered
                    let changed = sqlx::query(
                        r#"
                        UPDATE replicas
                        SET state = 'pending', attempts = 0, next_attempt_at = ?
                        WHERE fingerprint = ? AND endpoint = ? AND state != 'pending'
                        "#,
                    )
                    .bind(now)
                    .bind(fp)
                    .bind(backend.name())
                    .execute(&self.pool)
                    .await?;
                    if changed.rows_affected() > 0 {
                        report.deferred += changed.rows_affected();
                    }
                }
            }
        }

        info!(re_armed = report.deferred, "reconciliation pass complete");
        Ok(report)
    }

    /// Per-endpoint replica counts for `GetStorageHealth`.
    pub async fn storage_health(&self) -> Result<Vec<EndpointHealth>, EngineError> {
        let mut out = Vec::new();
        for name in self.endpoints.names() {
            let row = sqlx::query(
                r#"
                SELECT
                    COALESCE(SUM(state = 'synced'), 0)  AS synced,
                    COALESCE(SUM(state = 'pending'), 0) AS pending,
                    COALESCE(SUM(state = 'failed'), 0)  AS failed
                FROM replicas WHERE endpoint = ?
                "#,
            )
            .bind(&name)
            .fetch_one(&self.pool)
            .await?;
            out.push(EndpointHealth {
                endpoint: name,
                synced: row.get::<i64, _>("synced"),
                pending: row.get::<i64, _>("pending"),
                failed: row.get::<i64, _>("failed"),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_secs(2, 300, 0), 2);
        assert_eq!(backoff_secs(2, 300, 1), 4);
        assert_eq!(backoff_secs(2, 300, 2), 8);
        assert_eq!(backoff_secs(2, 300, 7), 256);
        assert_eq!(backoff_secs(2, 300, 8), 300);
        assert_eq!(backoff_secs(2, 300, 60), 300);
    }

    #[test]
    fn test_backoff_handles_negative_attempts() {
        assert_eq!(backoff_secs(2, 300, -3), 2);
    }
}
