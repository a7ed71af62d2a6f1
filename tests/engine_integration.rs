//! End-to-end engine tests over temp-dir endpoints and mock AI backends.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;

use pictor::config::Config;
use pictor::db;
use pictor::embedding::EmbeddingBackend;
use pictor::endpoint::{EndpointSet, StorageBackend};
use pictor::endpoint_local::LocalEndpoint;
use pictor::engine::Engine;
use pictor::errors::{AnalysisFailure, EngineError};
use pictor::index::SearchFilters;
use pictor::migrate;
use pictor::models::{TaskState, VisionOutput};
use pictor::vision::VisionBackend;

const DIMS: usize = 4;

/// Minimal valid PNG header plus a distinguishing payload.
fn png(payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    bytes.extend_from_slice(payload);
    bytes
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn test_config(dir: &Path) -> Config {
    let toml_str = format!(
        r#"
[db]
path = "{root}/catalog.sqlite"

[[storage.endpoints]]
name = "main"
kind = "local"
role = "primary"
root = "{root}/main"

[embedding]
provider = "openai"
model = "mock-embed"
dims = {dims}

[analysis]
workers = 2
max_attempts = 3
backoff_base_secs = 0
backoff_cap_secs = 0

[sync]
max_attempts = 1
backoff_base_secs = 0
backoff_cap_secs = 0
"#,
        root = dir.display(),
        dims = DIMS,
    );
    toml::from_str(&toml_str).unwrap()
}

/// Deterministic vision mock keyed on payload markers.
struct MockVision;

#[async_trait]
impl VisionBackend for MockVision {
    fn model_name(&self) -> &str {
        "mock-vision"
    }

    async fn analyze(&self, bytes: &[u8], _mime: &str) -> Result<VisionOutput, AnalysisFailure> {
        let subject = if contains(bytes, b"DOG") {
            "dog"
        } else if contains(bytes, b"CAT") {
            "cat"
        } else {
            "misc"
        };
        Ok(VisionOutput {
            description: format!("a {} in a photo", subject),
            tags: vec![(subject.to_string(), Some(0.9))],
        })
    }
}

/// Fails with a retryable error `failures` times, then succeeds.
struct FlakyVision {
    failures: AtomicU32,
    calls: AtomicU32,
}

impl FlakyVision {
    fn new(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl VisionBackend for FlakyVision {
    fn model_name(&self) -> &str {
        "flaky-vision"
    }

    async fn analyze(&self, _bytes: &[u8], _mime: &str) -> Result<VisionOutput, AnalysisFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AnalysisFailure::Retryable("HTTP 503: overloaded".into()));
        }
        Ok(VisionOutput {
            description: "a misc photo".into(),
            tags: vec![("misc".into(), None)],
        })
    }
}

/// Signals when analysis starts and blocks until released, so a test can
/// interleave a delete with an in-flight task.
struct BlockingVision {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl VisionBackend for BlockingVision {
    fn model_name(&self) -> &str {
        "blocking-vision"
    }

    async fn analyze(&self, _bytes: &[u8], _mime: &str) -> Result<VisionOutput, AnalysisFailure> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(VisionOutput {
            description: "a dog in a photo".into(),
            tags: vec![("dog".into(), Some(0.9))],
        })
    }
}

/// Keyword-keyed embedding mock so corpus and query vectors line up.
struct MockEmbedder;

fn vector_for(text: &str) -> Vec<f32> {
    if text.contains("dog") {
        vec![1.0, 0.0, 0.0, 0.0]
    } else if text.contains("cat") {
        vec![0.0, 1.0, 0.0, 0.0]
    } else {
        vec![0.0, 0.0, 1.0, 0.0]
    }
}

#[async_trait]
impl EmbeddingBackend for MockEmbedder {
    fn model_name(&self) -> &str {
        "mock-embed"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AnalysisFailure> {
        Ok(texts.iter().map(|t| vector_for(t)).collect())
    }
}

/// An endpoint that is unreachable, for backup-outage scenarios.
struct DownEndpoint {
    name: String,
}

#[async_trait]
impl StorageBackend for DownEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, _fingerprint: &str, _bytes: &[u8]) -> anyhow::Result<()> {
        anyhow::bail!("endpoint offline")
    }

    async fn get(&self, _fingerprint: &str) -> anyhow::Result<Option<Vec<u8>>> {
        anyhow::bail!("endpoint offline")
    }

    async fn delete(&self, _fingerprint: &str) -> anyhow::Result<()> {
        anyhow::bail!("endpoint offline")
    }

    async fn exists(&self, _fingerprint: &str) -> anyhow::Result<bool> {
        anyhow::bail!("endpoint offline")
    }

    async fn list(&self) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("endpoint offline")
    }
}

async fn engine_with(
    tmp: &TempDir,
    backends: Vec<Arc<dyn StorageBackend>>,
    vision: Option<Arc<dyn VisionBackend>>,
    embedder: Option<Arc<dyn EmbeddingBackend>>,
) -> (Engine, Config) {
    let cfg = test_config(tmp.path());
    let pool = db::connect(&cfg).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let endpoints = Arc::new(EndpointSet::from_backends(backends));
    let engine = Engine::assemble(pool, &cfg, endpoints, vision, embedder)
        .await
        .unwrap();
    (engine, cfg)
}

fn local(name: &str, root: &Path) -> Arc<dyn StorageBackend> {
    std::fs::create_dir_all(root).unwrap();
    Arc::new(LocalEndpoint::at(name, root))
}

#[tokio::test]
async fn test_ingest_analyze_search_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let (engine, _cfg) = engine_with(
        &tmp,
        vec![local("main", &tmp.path().join("main"))],
        Some(Arc::new(MockVision)),
        Some(Arc::new(MockEmbedder)),
    )
    .await;

    let dog = engine.ingest(&png(b"DOG photo")).await.unwrap();
    let cat = engine.ingest(&png(b"CAT photo")).await.unwrap();
    assert!(!dog.deduplicated);
    assert!(dog.task_id.is_some());

    engine.run_workers().await.unwrap();

    let status = engine.queue_status().await.unwrap();
    assert_eq!(status.succeeded, 2);
    assert_eq!(status.failed, 0);
    assert_eq!(engine.index_size(), 2);

    let hits = engine
        .search_text("dog", 5, &SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(hits[0].fingerprint, dog.fingerprint);
    assert_eq!(hits[0].description.as_deref(), Some("a dog in a photo"));

    let detail = engine.image_detail(&cat.fingerprint).await.unwrap();
    assert!(detail.indexed);
    assert_eq!(detail.tags.len(), 1);
    assert_eq!(detail.tags[0].label, "cat");
    assert_eq!(detail.tags[0].source, "ai");

    // Tag filter excludes the dog even for a dog query
    let hits = engine
        .search_text(
            "dog",
            5,
            &SearchFilters {
                mime: None,
                tag: Some("cat".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].fingerprint, cat.fingerprint);
}

#[tokio::test]
async fn test_duplicate_ingest_returns_existing_task() {
    let tmp = TempDir::new().unwrap();
    let (engine, _cfg) = engine_with(
        &tmp,
        vec![local("main", &tmp.path().join("main"))],
        Some(Arc::new(MockVision)),
        Some(Arc::new(MockEmbedder)),
    )
    .await;

    let first = engine.ingest(&png(b"same bytes")).await.unwrap();
    let second = engine.ingest(&png(b"same bytes")).await.unwrap();

    assert_eq!(first.fingerprint, second.fingerprint);
    assert!(second.deduplicated);
    assert_eq!(first.task_id, second.task_id);

    let status = engine.queue_status().await.unwrap();
    assert_eq!(status.queued, 1);
}

#[tokio::test]
async fn test_non_image_payload_rejected() {
    let tmp = TempDir::new().unwrap();
    let (engine, _cfg) = engine_with(
        &tmp,
        vec![local("main", &tmp.path().join("main"))],
        None,
        None,
    )
    .await;

    let err = engine.ingest(b"just some text, not an image").await.unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedFormat(_)));

    let status = engine.queue_status().await.unwrap();
    assert_eq!(status.queued, 0);
}

#[tokio::test]
async fn test_backup_outage_recovers_via_reconcile() {
    let tmp = TempDir::new().unwrap();
    let main_root = tmp.path().join("main");
    let backup_root = tmp.path().join("backup");

    let (engine, cfg) = engine_with(
        &tmp,
        vec![
            local("main", &main_root),
            Arc::new(DownEndpoint {
                name: "backup".into(),
            }),
        ],
        None,
        None,
    )
    .await;

    let outcome = engine.ingest(&png(b"precious memory")).await.unwrap();

    // Ingest succeeds while the backup is down; the copy is owed
    let health = engine.storage_health().await.unwrap();
    let backup = health.iter().find(|h| h.endpoint == "backup").unwrap();
    assert_eq!(backup.pending, 1);

    // One attempt allowed, so the failure goes terminal
    let report = engine.sync_pass().await.unwrap();
    assert_eq!(report.failed, 1);
    let health = engine.storage_health().await.unwrap();
    let backup = health.iter().find(|h| h.endpoint == "backup").unwrap();
    assert_eq!(backup.failed, 1);

    // The endpoint comes back; reconcile re-arms the record
    let pool = db::connect(&cfg).await.unwrap();
    let endpoints = Arc::new(EndpointSet::from_backends(vec![
        local("main", &main_root),
        local("backup", &backup_root),
    ]));
    let recovered = Engine::assemble(pool, &cfg, Arc::clone(&endpoints), None, None)
        .await
        .unwrap();

    recovered.reconcile().await.unwrap();
    let report = recovered.sync_pass().await.unwrap();
    assert_eq!(report.synced, 1);

    assert!(endpoints.by_name["backup"]
        .exists(&outcome.fingerprint)
        .await
        .unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_during_analysis_discards_result() {
    let tmp = TempDir::new().unwrap();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let (engine, _cfg) = engine_with(
        &tmp,
        vec![local("main", &tmp.path().join("main"))],
        Some(Arc::new(BlockingVision {
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
        })),
        Some(Arc::new(MockEmbedder)),
    )
    .await;
    let engine = Arc::new(engine);

    let outcome = engine.ingest(&png(b"DOG to be deleted")).await.unwrap();
    let task_id = outcome.task_id.clone().unwrap();

    let worker = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run_workers().await })
    };

    // Wait until the task is inside the vision call, then delete the image
    entered.notified().await;
    engine.delete(&outcome.fingerprint).await.unwrap();
    release.notify_one();
    worker.await.unwrap().unwrap();

    let task = engine.task_status(&task_id).await.unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.last_error.unwrap().contains("discarded"));

    // Nothing resurrected
    assert_eq!(engine.index_size(), 0);
    assert!(matches!(
        engine.image_detail(&outcome.fingerprint).await,
        Err(EngineError::NotFound { .. })
    ));
    let embeddings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
        .fetch_one(engine.pool())
        .await
        .unwrap();
    assert_eq!(embeddings, 0);
    let tags: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tags")
        .fetch_one(engine.pool())
        .await
        .unwrap();
    assert_eq!(tags, 0);
}

#[tokio::test]
async fn test_transient_failures_retry_then_succeed() {
    let tmp = TempDir::new().unwrap();
    let vision = Arc::new(FlakyVision::new(2));
    let (engine, _cfg) = engine_with(
        &tmp,
        vec![local("main", &tmp.path().join("main"))],
        Some(Arc::clone(&vision) as Arc<dyn VisionBackend>),
        Some(Arc::new(MockEmbedder)),
    )
    .await;

    let outcome = engine.ingest(&png(b"flaky subject")).await.unwrap();
    engine.run_workers().await.unwrap();

    let task = engine
        .task_status(&outcome.task_id.unwrap())
        .await
        .unwrap();
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(task.attempts, 2);
    assert_eq!(vision.calls.load(Ordering::SeqCst), 3);
    assert_eq!(engine.index_size(), 1);
}

#[tokio::test]
async fn test_retry_budget_exhaustion_goes_terminal() {
    let tmp = TempDir::new().unwrap();
    // Never succeeds; max_attempts = 3 in test config
    let vision = Arc::new(FlakyVision::new(u32::MAX));
    let (engine, _cfg) = engine_with(
        &tmp,
        vec![local("main", &tmp.path().join("main"))],
        Some(Arc::clone(&vision) as Arc<dyn VisionBackend>),
        Some(Arc::new(MockEmbedder)),
    )
    .await;

    let outcome = engine.ingest(&png(b"doomed")).await.unwrap();
    engine.run_workers().await.unwrap();

    let task = engine
        .task_status(&outcome.task_id.unwrap())
        .await
        .unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(vision.calls.load(Ordering::SeqCst), 3);
    assert_eq!(engine.index_size(), 0);

    // A terminal task never blocks other work
    let other = engine.ingest(&png(b"also doomed but queued")).await.unwrap();
    assert!(other.task_id.is_some());
}

#[tokio::test]
async fn test_delete_removes_everywhere() {
    let tmp = TempDir::new().unwrap();
    let main_root = tmp.path().join("main");
    let backup_root = tmp.path().join("backup");
    let endpoints: Vec<Arc<dyn StorageBackend>> =
        vec![local("main", &main_root), local("backup", &backup_root)];
    let backup = Arc::clone(&endpoints[1]);

    let (engine, _cfg) = engine_with(
        &tmp,
        endpoints,
        Some(Arc::new(MockVision)),
        Some(Arc::new(MockEmbedder)),
    )
    .await;

    let outcome = engine.ingest(&png(b"DOG everywhere")).await.unwrap();
    engine.run_workers().await.unwrap();
    engine.sync_pass().await.unwrap();
    assert!(backup.exists(&outcome.fingerprint).await.unwrap());
    assert_eq!(engine.index_size(), 1);

    engine.delete(&outcome.fingerprint).await.unwrap();

    assert_eq!(engine.index_size(), 0);
    assert!(!backup.exists(&outcome.fingerprint).await.unwrap());
    assert!(matches!(
        engine.store().get(&outcome.fingerprint, None).await,
        Err(EngineError::NotFound { .. })
    ));
    let hits = engine
        .search_text("dog", 5, &SearchFilters::default())
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_partial_delete_survives_and_retry_converges() {
    let tmp = TempDir::new().unwrap();
    let main_root = tmp.path().join("main");
    let backup_root = tmp.path().join("backup");

    let (engine, cfg) = engine_with(
        &tmp,
        vec![
            local("main", &main_root),
            Arc::new(DownEndpoint {
                name: "backup".into(),
            }),
        ],
        None,
        None,
    )
    .await;

    let outcome = engine.ingest(&png(b"hard to kill")).await.unwrap();
    let fp = outcome.fingerprint.clone();

    let err = engine.delete(&fp).await.unwrap_err();
    match err {
        EngineError::PartialDelete {
            fingerprint,
            failed,
        } => {
            assert_eq!(fingerprint, fp);
            assert_eq!(failed, vec!["backup".to_string()]);
        }
        other => panic!("expected PartialDelete, got {:?}", other),
    }

    // The catalog row survives so the delete can be retried, and the
    // failed endpoint keeps its replica row; the cleared one does not
    assert!(engine.image_detail(&fp).await.is_ok());
    let backup_rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM replicas WHERE fingerprint = ? AND endpoint = 'backup'",
    )
    .bind(&fp)
    .fetch_one(engine.pool())
    .await
    .unwrap();
    assert_eq!(backup_rows, 1);
    let main_rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM replicas WHERE fingerprint = ? AND endpoint = 'main'",
    )
    .bind(&fp)
    .fetch_one(engine.pool())
    .await
    .unwrap();
    assert_eq!(main_rows, 0);

    // The endpoint comes back; a retried delete converges
    let pool = db::connect(&cfg).await.unwrap();
    let endpoints = Arc::new(EndpointSet::from_backends(vec![
        local("main", &main_root),
        local("backup", &backup_root),
    ]));
    let recovered = Engine::assemble(pool, &cfg, endpoints, None, None)
        .await
        .unwrap();

    recovered.delete(&fp).await.unwrap();
    assert!(matches!(
        recovered.store().get(&fp, None).await,
        Err(EngineError::NotFound { .. })
    ));
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM replicas WHERE fingerprint = ?")
        .bind(&fp)
        .fetch_one(recovered.pool())
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn test_delete_clears_rows_of_unconfigured_endpoints() {
    let tmp = TempDir::new().unwrap();
    let (engine, _cfg) = engine_with(
        &tmp,
        vec![local("main", &tmp.path().join("main"))],
        None,
        None,
    )
    .await;

    let outcome = engine.ingest(&png(b"once mirrored")).await.unwrap();

    // A replica row from an endpoint that has since left the config
    sqlx::query("INSERT INTO replicas (fingerprint, endpoint, state) VALUES (?, 'retired', 'synced')")
        .bind(&outcome.fingerprint)
        .execute(engine.pool())
        .await
        .unwrap();

    engine.delete(&outcome.fingerprint).await.unwrap();

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM replicas WHERE fingerprint = ?")
        .bind(&outcome.fingerprint)
        .fetch_one(engine.pool())
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn test_user_tags_survive_reanalysis() {
    let tmp = TempDir::new().unwrap();
    let (engine, _cfg) = engine_with(
        &tmp,
        vec![local("main", &tmp.path().join("main"))],
        Some(Arc::new(MockVision)),
        Some(Arc::new(MockEmbedder)),
    )
    .await;

    let outcome = engine.ingest(&png(b"DOG on holiday")).await.unwrap();
    engine.run_workers().await.unwrap();

    engine.add_tag(&outcome.fingerprint, " Vacation ").await.unwrap();

    engine.reanalyze(&outcome.fingerprint).await.unwrap();
    engine.run_workers().await.unwrap();

    let detail = engine.image_detail(&outcome.fingerprint).await.unwrap();
    let labels: Vec<(&str, &str)> = detail
        .tags
        .iter()
        .map(|t| (t.label.as_str(), t.source.as_str()))
        .collect();
    assert!(labels.contains(&("dog", "ai")));
    assert!(labels.contains(&("vacation", "user")));

    // User tag usable as a search filter
    let hits = engine
        .search_text(
            "dog",
            5,
            &SearchFilters {
                mime: None,
                tag: Some("vacation".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);

    engine
        .remove_tag(&outcome.fingerprint, "vacation", None)
        .await
        .unwrap();
    let detail = engine.image_detail(&outcome.fingerprint).await.unwrap();
    assert!(!detail.tags.iter().any(|t| t.label == "vacation"));
}

#[tokio::test]
async fn test_index_rebuilds_from_catalog_on_startup() {
    let tmp = TempDir::new().unwrap();
    let main_root = tmp.path().join("main");
    let (engine, cfg) = engine_with(
        &tmp,
        vec![local("main", &main_root)],
        Some(Arc::new(MockVision)),
        Some(Arc::new(MockEmbedder)),
    )
    .await;

    let outcome = engine.ingest(&png(b"CAT persists")).await.unwrap();
    engine.run_workers().await.unwrap();
    assert_eq!(engine.index_size(), 1);
    drop(engine);

    // A fresh engine over the same catalog reloads the index
    let pool = db::connect(&cfg).await.unwrap();
    let endpoints = Arc::new(EndpointSet::from_backends(vec![local("main", &main_root)]));
    let reopened = Engine::assemble(
        pool,
        &cfg,
        endpoints,
        Some(Arc::new(MockVision)),
        Some(Arc::new(MockEmbedder)),
    )
    .await
    .unwrap();

    assert_eq!(reopened.index_size(), 1);
    let hits = reopened
        .search_text("cat", 5, &SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(hits[0].fingerprint, outcome.fingerprint);
}
