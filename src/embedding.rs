//! Embedding backend abstraction and implementations.
//!
//! A single [`EmbeddingBackend`] serves both sides of semantic search:
//! descriptions are embedded at analysis time and queries at search time,
//! which keeps corpus and query vectors comparable. Implementations:
//!
//! - **[`OpenAiEmbedder`]** — OpenAI-compatible `/embeddings` API with
//!   batching, retry, and exponential backoff.
//! - **`LocalEmbedder`** — fastembed, behind the
//!   `local-embeddings-fastembed` feature; no network after model download.
//!
//! Also provides the vector codecs used for SQLite BLOB storage and the
//! similarity metrics.
//!
//! # Retry Strategy
//!
//! The remote provider retries transient errors with exponential backoff:
//! HTTP 429 and 5xx retry, other 4xx fail immediately, network errors
//! retry. Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5).

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::errors::AnalysisFailure;

/// Similarity metric, fixed at index-build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Cosine,
    Dot,
}

impl Metric {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cosine" => Some(Metric::Cosine),
            "dot" => Some(Metric::Dot),
            _ => None,
        }
    }

    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_similarity(a, b),
            Metric::Dot => dot_product(a, b),
        }
    }
}

/// Capability interface for embedding providers.
///
/// Failures come back classified so the analysis pipeline can decide
/// between requeue and terminal failure without inspecting provider
/// details.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn model_name(&self) -> &str;

    /// Fixed output dimensionality. Changing it invalidates the vector
    /// index and requires a full reindex.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AnalysisFailure>;
}

/// Construct the configured backend.
pub fn create_backend(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingBackend>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Box::new(local::LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => anyhow::bail!(
            "embedding.provider = \"local\" requires building with --features local-embeddings-fastembed"
        ),
        "disabled" => anyhow::bail!("Embedding provider is disabled"),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

// ============ OpenAI-compatible Provider ============

/// Remote embedding provider speaking the OpenAI embeddings protocol.
pub struct OpenAiEmbedder {
    url: String,
    model: String,
    dims: usize,
    api_key: Option<String>,
    batch_size: usize,
    max_retries: u32,
    timeout: Duration,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for openai provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for openai provider"))?;
        let api_key = std::env::var(&config.api_key_env).ok();

        Ok(Self {
            url: format!("{}/embeddings", config.endpoint.trim_end_matches('/')),
            model,
            dims,
            api_key,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AnalysisFailure> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| AnalysisFailure::Permanent(format!("http client: {}", e)))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err: Option<AnalysisFailure> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = client.post(&self.url).json(&body);
            if let Some(ref key) = self.api_key {
                req = req.header("Authorization", format!("Bearer {}", key));
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            AnalysisFailure::Retryable(format!("response read failed: {}", e))
                        })?;
                        return parse_embeddings_response(&json, self.dims);
                    }

                    let text = response.text().await.unwrap_or_default();
                    let failure = AnalysisFailure::from_status(status.as_u16(), &text);
                    if !failure.is_retryable() {
                        return Err(failure);
                    }
                    last_err = Some(failure);
                }
                Err(e) => {
                    last_err = Some(AnalysisFailure::Retryable(format!(
                        "embedding request failed: {}",
                        e
                    )));
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| AnalysisFailure::Retryable("embedding retries exhausted".into())))
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AnalysisFailure> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_batch(batch).await?);
        }
        Ok(out)
    }
}

/// Extract `data[].embedding` arrays in order, verifying dimensionality.
fn parse_embeddings_response(
    json: &serde_json::Value,
    expected_dims: usize,
) -> Result<Vec<Vec<f32>>, AnalysisFailure> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| AnalysisFailure::Permanent("response missing data array".to_string()))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| AnalysisFailure::Permanent("response missing embedding".to_string()))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        if vec.len() != expected_dims {
            return Err(AnalysisFailure::Permanent(format!(
                "provider returned {} dims, config says {}",
                vec.len(),
                expected_dims
            )));
        }
        embeddings.push(vec);
    }

    Ok(embeddings)
}

// ============ Local Provider (fastembed) ============

#[cfg(feature = "local-embeddings-fastembed")]
mod local {
    use super::*;
    use std::sync::Mutex;

    /// In-process embedding via fastembed. Model files are downloaded once
    /// and cached; inference runs on the blocking thread pool.
    pub struct LocalEmbedder {
        model: Mutex<fastembed::TextEmbedding>,
        model_name: String,
        dims: usize,
    }

    impl LocalEmbedder {
        pub fn new(config: &EmbeddingConfig) -> Result<Self> {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| "BAAI/bge-small-en-v1.5".to_string());
            let dims = config
                .dims
                .ok_or_else(|| anyhow::anyhow!("embedding.dims required for local provider"))?;

            let model = fastembed::TextEmbedding::try_new(Default::default())?;

            Ok(Self {
                model: Mutex::new(model),
                model_name,
                dims,
            })
        }
    }

    #[async_trait]
    impl EmbeddingBackend for LocalEmbedder {
        fn model_name(&self) -> &str {
            &self.model_name
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AnalysisFailure> {
            let texts = texts.to_vec();
            let mut guard = self.model.lock().map_err(|_| {
                AnalysisFailure::Permanent("local embedder poisoned".to_string())
            })?;
            let vectors = tokio::task::block_in_place(|| guard.embed(texts, None))
                .map_err(|e| AnalysisFailure::Permanent(format!("local embedding failed: {}", e)))?;
            Ok(vectors)
        }
    }
}

// ============ Vector codecs & metrics ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`. Returns `0.0` for empty or
/// mismatched-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Inner product. Returns `0.0` for mismatched-length vectors.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty_or_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_dot_product() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![4.0, 5.0, 6.0];
        assert!((dot_product(&a, &b) - 32.0).abs() < 1e-6);
        assert_eq!(dot_product(&a, &[1.0]), 0.0);
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!(Metric::parse("cosine"), Some(Metric::Cosine));
        assert_eq!(Metric::parse("dot"), Some(Metric::Dot));
        assert_eq!(Metric::parse("euclidean"), None);
    }

    #[test]
    fn test_parse_embeddings_response_order_and_dims() {
        let json = serde_json::json!({
            "data": [
                { "index": 0, "embedding": [1.0, 0.0] },
                { "index": 1, "embedding": [0.0, 1.0] }
            ]
        });
        let vecs = parse_embeddings_response(&json, 2).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_embeddings_response_wrong_dims_is_permanent() {
        let json = serde_json::json!({ "data": [ { "embedding": [1.0, 0.0, 0.0] } ] });
        let err = parse_embeddings_response(&json, 2).unwrap_err();
        assert!(!err.is_retryable());
    }
}
