//! Local filesystem endpoint.
//!
//! Objects live under `root/<aa>/<fingerprint>` where `aa` is the first two
//! hex characters of the fingerprint, keeping directories small for large
//! corpora. Writes go to a temp file in the same directory and are renamed
//! into place, so readers never observe a partial object.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::EndpointConfig;
use crate::endpoint::StorageBackend;

pub struct LocalEndpoint {
    name: String,
    root: PathBuf,
}

impl LocalEndpoint {
    pub fn new(cfg: &EndpointConfig) -> Result<Self> {
        let root = cfg
            .root
            .clone()
            .context("local endpoint requires a root path")?;
        Ok(Self {
            name: cfg.name.clone(),
            root,
        })
    }

    /// Build directly from a name and root, bypassing config. Used by tests.
    pub fn at(name: &str, root: &Path) -> Self {
        Self {
            name: name.to_string(),
            root: root.to_path_buf(),
        }
    }

    fn object_path(&self, fingerprint: &str) -> PathBuf {
        let shard = &fingerprint[..fingerprint.len().min(2)];
        self.root.join(shard).join(fingerprint)
    }
}

#[async_trait]
impl StorageBackend for LocalEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, fingerprint: &str, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(fingerprint);
        let dir = path.parent().expect("object path has a shard directory");
        let bytes = bytes.to_vec();
        let path_clone = path.clone();
        let dir = dir.to_path_buf();

        // Blocking FS work off the async runtime
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&dir)?;
            let tmp = dir.join(format!(
                ".tmp-{}-{}",
                std::process::id(),
                path_clone
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("obj")
            ));
            std::fs::write(&tmp, &bytes)?;
            std::fs::rename(&tmp, &path_clone)?;
            Ok(())
        })
        .await?
        .with_context(|| format!("local put failed for {}", fingerprint))
    }

    async fn get(&self, fingerprint: &str) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(fingerprint);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("local get failed for {}", fingerprint)),
        }
    }

    async fn delete(&self, fingerprint: &str) -> Result<()> {
        let path = self.object_path(fingerprint);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("local delete failed for {}", fingerprint)),
        }
    }

    async fn exists(&self, fingerprint: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.object_path(fingerprint)).await?)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            if !root.exists() {
                return Ok(out);
            }
            for entry in WalkDir::new(&root).min_depth(2).max_depth(2) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    // Skip leftover temp files from interrupted writes
                    if name.starts_with(".tmp-") {
                        continue;
                    }
                    out.push(name.to_string());
                }
            }
            out.sort();
            Ok(out)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn endpoint(tmp: &TempDir) -> LocalEndpoint {
        LocalEndpoint::at("test", tmp.path())
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let ep = endpoint(&tmp);
        ep.put("abcd1234", b"hello").await.unwrap();
        assert_eq!(ep.get("abcd1234").await.unwrap(), Some(b"hello".to_vec()));
        assert!(ep.exists("abcd1234").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_absent_is_none() {
        let tmp = TempDir::new().unwrap();
        let ep = endpoint(&tmp);
        assert_eq!(ep.get("ffff").await.unwrap(), None);
        assert!(!ep.exists("ffff").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let ep = endpoint(&tmp);
        ep.put("abcd", b"x").await.unwrap();
        ep.delete("abcd").await.unwrap();
        ep.delete("abcd").await.unwrap();
        assert_eq!(ep.get("abcd").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_sees_sharded_objects() {
        let tmp = TempDir::new().unwrap();
        let ep = endpoint(&tmp);
        ep.put("aa11", b"1").await.unwrap();
        ep.put("bb22", b"2").await.unwrap();
        let mut listed = ep.list().await.unwrap();
        listed.sort();
        assert_eq!(listed, vec!["aa11".to_string(), "bb22".to_string()]);
    }
}
