use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub endpoints: Vec<EndpointConfig>,
}

/// Role of an endpoint in the replication topology.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Primary,
    Backup,
}

/// One physical storage target. `kind` selects the backend implementation.
#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    /// Unique name, referenced by replication records and health output.
    pub name: String,
    /// `"local"` or `"s3"`.
    pub kind: String,
    pub role: EndpointRole,

    // local
    #[serde(default)]
    pub root: Option<PathBuf>,

    // s3
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL for S3-compatible stores (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Environment variable holding the access key id.
    #[serde(default = "default_access_key_env")]
    pub access_key_env: String,
    /// Environment variable holding the secret access key.
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,
    /// HTTP timeout for requests to this endpoint. Ignored for local
    /// endpoints.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_access_key_env() -> String {
    "AWS_ACCESS_KEY_ID".to_string()
}
fn default_secret_key_env() -> String {
    "AWS_SECRET_ACCESS_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct VisionConfig {
    /// Base URL of an OpenAI-compatible API (e.g. `https://api.openai.com/v1`
    /// or `http://localhost:11434/v1`). The `/chat/completions` path is
    /// appended automatically.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable holding the bearer token. Optional for local
    /// servers that do not check authorization.
    #[serde(default = "default_vision_key_env")]
    pub api_key_env: String,
    /// Prompt sent alongside the image. `{max_tags}` is substituted.
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: None,
            api_key_env: default_vision_key_env(),
            prompt: default_prompt(),
            max_tags: default_max_tags(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_vision_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_prompt() -> String {
    "Describe this image in one or two sentences, then list up to {max_tags} \
     short lowercase tags. Respond with JSON: \
     {\"description\": \"...\", \"tags\": [{\"label\": \"...\", \"confidence\": 0.0}]}"
        .to_string()
}
fn default_max_tags() -> usize {
    12
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"disabled"`, `"openai"`, or `"local"` (fastembed, feature-gated).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the OpenAI-compatible embeddings API.
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_embedding_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Similarity metric fixed at index-build time: `"cosine"` or `"dot"`.
    #[serde(default = "default_metric")]
    pub metric: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            endpoint: default_embedding_endpoint(),
            api_key_env: default_embedding_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            metric: default_metric(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_embedding_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_metric() -> String {
    "cosine".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    /// Bounded worker count draining the task queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Retryable failures allowed before a task goes terminal.
    #[serde(default = "default_task_max_attempts")]
    pub max_attempts: i64,
    /// Base delay for `base * 2^attempt` requeue backoff.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_task_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_task_max_attempts() -> i64 {
    5
}
fn default_backoff_base_secs() -> u64 {
    2
}
fn default_backoff_cap_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_sync_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_sync_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

fn default_sync_max_attempts() -> i64 {
    8
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Validate cross-field constraints that serde defaults cannot express.
pub fn validate(config: &Config) -> Result<()> {
    if config.storage.endpoints.is_empty() {
        anyhow::bail!("storage.endpoints must list at least one endpoint");
    }

    let primaries = config
        .storage
        .endpoints
        .iter()
        .filter(|e| e.role == EndpointRole::Primary)
        .count();
    if primaries != 1 {
        anyhow::bail!(
            "exactly one storage endpoint must have role = \"primary\" (found {})",
            primaries
        );
    }

    let mut names = std::collections::HashSet::new();
    for ep in &config.storage.endpoints {
        if !names.insert(ep.name.as_str()) {
            anyhow::bail!("duplicate endpoint name: '{}'", ep.name);
        }
        match ep.kind.as_str() {
            "local" => {
                if ep.root.is_none() {
                    anyhow::bail!("endpoint '{}': kind = \"local\" requires root", ep.name);
                }
            }
            "s3" => {
                if ep.bucket.is_none() {
                    anyhow::bail!("endpoint '{}': kind = \"s3\" requires bucket", ep.name);
                }
            }
            other => anyhow::bail!(
                "endpoint '{}': unknown kind '{}'. Must be local or s3.",
                ep.name,
                other
            ),
        }
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or local.",
            other
        ),
    }

    match config.embedding.metric.as_str() {
        "cosine" | "dot" => {}
        other => anyhow::bail!("Unknown metric: '{}'. Must be cosine or dot.", other),
    }

    if config.analysis.workers == 0 {
        anyhow::bail!("analysis.workers must be > 0");
    }
    if config.analysis.max_attempts < 1 {
        anyhow::bail!("analysis.max_attempts must be >= 1");
    }

    Ok(())
}

impl Config {
    /// Endpoint configs ordered primary-first, preserving the configured
    /// order among backups. This is the read-fallback order.
    pub fn endpoints_primary_first(&self) -> Vec<&EndpointConfig> {
        let mut out: Vec<&EndpointConfig> = self
            .storage
            .endpoints
            .iter()
            .filter(|e| e.role == EndpointRole::Primary)
            .collect();
        out.extend(
            self.storage
                .endpoints
                .iter()
                .filter(|e| e.role == EndpointRole::Backup),
        );
        out
    }

    pub fn primary_endpoint(&self) -> &EndpointConfig {
        // validate() guarantees exactly one
        self.storage
            .endpoints
            .iter()
            .find(|e| e.role == EndpointRole::Primary)
            .expect("validated config has a primary endpoint")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml() -> String {
        r#"
[db]
path = "/tmp/pictor.sqlite"

[[storage.endpoints]]
name = "main"
kind = "local"
role = "primary"
root = "/tmp/pictor-data"
"#
        .to_string()
    }

    #[test]
    fn test_minimal_config_parses() {
        let cfg: Config = toml::from_str(&base_toml()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.analysis.workers, 4);
        assert_eq!(cfg.embedding.provider, "disabled");
        assert_eq!(cfg.primary_endpoint().name, "main");
    }

    #[test]
    fn test_rejects_two_primaries() {
        let toml_str = base_toml()
            + r#"
[[storage.endpoints]]
name = "other"
kind = "local"
role = "primary"
root = "/tmp/other"
"#;
        let cfg: Config = toml::from_str(&toml_str).unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_rejects_s3_without_bucket() {
        let toml_str = base_toml()
            + r#"
[[storage.endpoints]]
name = "backup"
kind = "s3"
role = "backup"
"#;
        let cfg: Config = toml::from_str(&toml_str).unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_rejects_enabled_embedding_without_dims() {
        let toml_str = base_toml()
            + r#"
[embedding]
provider = "openai"
model = "text-embedding-3-small"
"#;
        let cfg: Config = toml::from_str(&toml_str).unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_endpoint_timeout_default_and_override() {
        let toml_str = base_toml()
            + r#"
[[storage.endpoints]]
name = "fast"
kind = "s3"
role = "backup"
bucket = "b"
timeout_secs = 5
"#;
        let cfg: Config = toml::from_str(&toml_str).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.storage.endpoints[0].timeout_secs, 30);
        assert_eq!(cfg.storage.endpoints[1].timeout_secs, 5);
    }

    #[test]
    fn test_endpoints_primary_first_order() {
        let toml_str = r#"
[db]
path = "/tmp/pictor.sqlite"

[[storage.endpoints]]
name = "backup-a"
kind = "local"
role = "backup"
root = "/tmp/a"

[[storage.endpoints]]
name = "main"
kind = "local"
role = "primary"
root = "/tmp/main"

[[storage.endpoints]]
name = "backup-b"
kind = "local"
role = "backup"
root = "/tmp/b"
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        let order: Vec<&str> = cfg
            .endpoints_primary_first()
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(order, vec!["main", "backup-a", "backup-b"]);
    }
}
