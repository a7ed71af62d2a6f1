use anyhow::Result;
use sqlx::SqlitePool;

/// Create the schema. Idempotent; safe to run on every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Catalog of stored images, keyed by content fingerprint
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS images (
            fingerprint TEXT PRIMARY KEY,
            size_bytes INTEGER NOT NULL,
            mime TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per (image, endpoint) pair tracking replication state
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS replicas (
            fingerprint TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL DEFAULT 0,
            last_attempt_at INTEGER,
            last_error TEXT,
            PRIMARY KEY (fingerprint, endpoint)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Durable analysis queue
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            fingerprint TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'queued',
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Tags: AI and user sourced, one row per (image, label, source)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tags (
            fingerprint TEXT NOT NULL,
            label TEXT NOT NULL,
            source TEXT NOT NULL,
            confidence REAL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (fingerprint, label, source)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One embedding per image, produced by the most recent successful
    // analysis. Vectors are little-endian f32 BLOBs.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            fingerprint TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_replicas_state ON replicas(state)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state, next_attempt_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_fingerprint ON tasks(fingerprint)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tags_fingerprint ON tags(fingerprint)")
        .execute(pool)
        .await?;

    Ok(())
}
