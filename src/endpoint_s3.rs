//! S3-compatible storage endpoint.
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication,
//! using only pure-Rust dependencies (`hmac`, `sha2`) for signing — no
//! C library dependencies. Custom endpoint URLs support MinIO and
//! LocalStack. Objects are stored under `<prefix><fingerprint>`.
//!
//! # Configuration
//!
//! ```toml
//! [[storage.endpoints]]
//! name = "offsite"
//! kind = "s3"
//! role = "backup"
//! bucket = "acme-images"
//! prefix = "pictor/"
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! # access_key_env = "MINIO_ACCESS_KEY"
//! # secret_key_env = "MINIO_SECRET_KEY"
//! ```
//!
//! Credentials are read from the environment variables named in the config
//! (defaulting to `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`), with an
//! optional `AWS_SESSION_TOKEN`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::EndpointConfig;
use crate::endpoint::StorageBackend;

type HmacSha256 = Hmac<Sha256>;

pub struct S3Endpoint {
    name: String,
    bucket: String,
    prefix: String,
    region: String,
    endpoint_url: Option<String>,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3Endpoint {
    pub fn new(cfg: &EndpointConfig) -> Result<Self> {
        let bucket = cfg
            .bucket
            .clone()
            .context("s3 endpoint requires a bucket")?;
        let creds = AwsCredentials::from_env(&cfg.access_key_env, &cfg.secret_key_env)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;

        Ok(Self {
            name: cfg.name.clone(),
            bucket,
            prefix: cfg.prefix.clone().unwrap_or_default(),
            region: cfg.region.clone(),
            endpoint_url: cfg.endpoint_url.clone(),
            creds,
            client,
        })
    }

    fn host(&self) -> String {
        if let Some(ref endpoint) = self.endpoint_url {
            endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string()
        } else {
            format!("{}.s3.{}.amazonaws.com", self.bucket, self.region)
        }
    }

    fn scheme(&self) -> &'static str {
        match self.endpoint_url {
            Some(ref url) if url.starts_with("http://") => "http",
            _ => "https",
        }
    }

    /// With a custom endpoint the bucket moves into the path
    /// (path-style addressing, the form MinIO expects).
    fn object_uri(&self, fingerprint: &str) -> String {
        let key = format!("{}{}", self.prefix, fingerprint);
        let encoded: String = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        if self.endpoint_url.is_some() {
            format!("/{}/{}", self.bucket, encoded)
        } else {
            format!("/{}", encoded)
        }
    }

    fn list_uri(&self) -> String {
        if self.endpoint_url.is_some() {
            format!("/{}/", self.bucket)
        } else {
            "/".to_string()
        }
    }

    /// Sign and send one request. `payload` is the request body (empty for
    /// GET/DELETE/HEAD); `query` must already be in canonical sorted form.
    async fn signed_request(
        &self,
        method: &str,
        uri: &str,
        query: &[(String, String)],
        payload: &[u8],
    ) -> Result<reqwest::Response> {
        let host = self.host();
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(payload);

        let mut sorted = query.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, uri, canonical_querystring, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", self.scheme(), host, uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut req = match method {
            "GET" => self.client.get(&url),
            "PUT" => self.client.put(&url).body(payload.to_vec()),
            "DELETE" => self.client.delete(&url),
            "HEAD" => self.client.head(&url),
            other => bail!("unsupported method {}", other),
        };

        req = req
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }

        req.send().await.map_err(|e| {
            anyhow::anyhow!("S3 {} s3://{}{} failed: {}", method, self.bucket, uri, e)
        })
    }
}

#[async_trait]
impl StorageBackend for S3Endpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, fingerprint: &str, bytes: &[u8]) -> Result<()> {
        let uri = self.object_uri(fingerprint);
        let resp = self.signed_request("PUT", &uri, &[], bytes).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 PutObject failed (HTTP {}) for '{}': {}",
                status,
                fingerprint,
                body.chars().take(500).collect::<String>()
            );
        }
        Ok(())
    }

    async fn get(&self, fingerprint: &str) -> Result<Option<Vec<u8>>> {
        let uri = self.object_uri(fingerprint);
        let resp = self.signed_request("GET", &uri, &[], b"").await?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            bail!("S3 GetObject failed (HTTP {}) for '{}'", status, fingerprint);
        }
        Ok(Some(resp.bytes().await?.to_vec()))
    }

    async fn delete(&self, fingerprint: &str) -> Result<()> {
        let uri = self.object_uri(fingerprint);
        let resp = self.signed_request("DELETE", &uri, &[], b"").await?;
        let status = resp.status();
        // S3 DELETE is idempotent: 204 for both present and absent keys
        if !status.is_success() && status.as_u16() != 404 {
            bail!(
                "S3 DeleteObject failed (HTTP {}) for '{}'",
                status,
                fingerprint
            );
        }
        Ok(())
    }

    async fn exists(&self, fingerprint: &str) -> Result<bool> {
        let uri = self.object_uri(fingerprint);
        let resp = self.signed_request("HEAD", &uri, &[], b"").await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(true);
        }
        if status.as_u16() == 404 {
            return Ok(false);
        }
        bail!(
            "S3 HeadObject failed (HTTP {}) for '{}'",
            status,
            fingerprint
        );
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut fingerprints = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !self.prefix.is_empty() {
                query.push(("prefix".to_string(), self.prefix.clone()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self
                .signed_request("GET", &self.list_uri(), &query, b"")
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                );
            }

            let xml = resp.text().await?;
            let (keys, is_truncated, next_token) = parse_list_response(&xml);
            for key in keys {
                // Strip the configured prefix back off to recover fingerprints
                let fp = key.strip_prefix(&self.prefix).unwrap_or(&key).to_string();
                if !fp.is_empty() {
                    fingerprints.push(fp);
                }
            }

            if is_truncated {
                continuation_token = next_token;
            } else {
                break;
            }
        }

        fingerprints.sort();
        Ok(fingerprints)
    }
}

// ============ AWS Credentials ============

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env(access_key_env: &str, secret_key_env: &str) -> Result<Self> {
        let access_key_id = std::env::var(access_key_env)
            .with_context(|| format!("{} environment variable not set", access_key_env))?;
        let secret_access_key = std::env::var(secret_key_env)
            .with_context(|| format!("{} environment variable not set", secret_key_env))?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986 (used in SigV4 canonical requests).
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ XML Parsing (minimal, no extra deps) ============

/// Parse a `ListObjectsV2` XML response into object keys plus pagination
/// state.
fn parse_list_response(xml: &str) -> (Vec<String>, bool, Option<String>) {
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut keys = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        if let Some(end) = remaining[block_start..].find("</Contents>") {
            let block = &remaining[block_start..block_start + end];
            if let Some(key) = extract_xml_value(block, "Key") {
                if !key.is_empty() && !key.ends_with('/') {
                    keys.push(key);
                }
            }
            remaining = &remaining[block_start + end + "</Contents>".len()..];
        } else {
            break;
        }
    }

    (keys, is_truncated, next_token)
}

/// Extract the text content of an XML tag (simple, non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    if let Some(start) = xml.find(&open) {
        let value_start = start + open.len();
        if let Some(end) = xml[value_start..].find(&close) {
            return Some(xml[value_start..value_start + end].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_encode_passthrough_and_escape() {
        assert_eq!(uri_encode("abc-123_~."), "abc-123_~.");
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn test_parse_list_response() {
        let xml = r#"
<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>tok123</NextContinuationToken>
  <Contents><Key>pictor/aa11</Key><Size>5</Size></Contents>
  <Contents><Key>pictor/bb22</Key><Size>9</Size></Contents>
  <Contents><Key>pictor/dir/</Key></Contents>
</ListBucketResult>"#;
        let (keys, truncated, token) = parse_list_response(xml);
        assert_eq!(keys, vec!["pictor/aa11".to_string(), "pictor/bb22".to_string()]);
        assert!(truncated);
        assert_eq!(token.as_deref(), Some("tok123"));
    }

    #[test]
    fn test_parse_list_response_empty() {
        let (keys, truncated, token) = parse_list_response("<ListBucketResult></ListBucketResult>");
        assert!(keys.is_empty());
        assert!(!truncated);
        assert!(token.is_none());
    }

    #[test]
    fn test_signing_key_is_deterministic() {
        let a = derive_signing_key("secret", "20260101", "us-east-1", "s3");
        let b = derive_signing_key("secret", "20260101", "us-east-1", "s3");
        assert_eq!(a, b);
        let c = derive_signing_key("secret", "20260102", "us-east-1", "s3");
        assert_ne!(a, c);
    }
}
