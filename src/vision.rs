//! Vision model abstraction and the OpenAI-compatible implementation.
//!
//! A [`VisionBackend`] turns image bytes into a description plus candidate
//! tags. The concrete [`OpenAiVision`] posts the image as a base64
//! `image_url` part to a `/chat/completions` endpoint (works with OpenAI,
//! Ollama, vLLM, and other compatible providers) and parses the model's
//! JSON reply. Errors come back pre-classified: network trouble, timeouts,
//! 429 and 5xx are retryable; auth rejections and unparseable output are
//! permanent.

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use std::time::Duration;

use crate::config::VisionConfig;
use crate::errors::AnalysisFailure;
use crate::models::VisionOutput;

/// Capability interface for image analysis providers.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    fn model_name(&self) -> &str;

    async fn analyze(&self, bytes: &[u8], mime: &str) -> Result<VisionOutput, AnalysisFailure>;
}

/// Vision provider speaking the OpenAI chat-completions protocol.
pub struct OpenAiVision {
    url: String,
    model: String,
    api_key: Option<String>,
    prompt: String,
    timeout: Duration,
}

impl OpenAiVision {
    pub fn new(config: &VisionConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("vision.endpoint required"))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("vision.model required"))?;

        // Missing key is fine for local servers; remote providers will
        // reject the call with a permanent 401
        let api_key = std::env::var(&config.api_key_env).ok();

        let prompt = config
            .prompt
            .replace("{max_tags}", &config.max_tags.to_string());

        Ok(Self {
            url: format!("{}/chat/completions", endpoint.trim_end_matches('/')),
            model,
            api_key,
            prompt,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl VisionBackend for OpenAiVision {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn analyze(&self, bytes: &[u8], mime: &str) -> Result<VisionOutput, AnalysisFailure> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| AnalysisFailure::Permanent(format!("http client: {}", e)))?;

        let data_url = format!(
            "data:{};base64,{}",
            mime,
            base64::engine::general_purpose::STANDARD.encode(bytes)
        );

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": self.prompt },
                    { "type": "image_url", "image_url": { "url": data_url } }
                ]
            }],
            "temperature": 0.2,
            "response_format": { "type": "json_object" },
        });

        let mut req = client.post(&self.url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let resp = req.send().await.map_err(|e| {
            // Timeouts and connection failures are transient by definition
            AnalysisFailure::Retryable(format!("vision request failed: {}", e))
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AnalysisFailure::from_status(status.as_u16(), &text));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AnalysisFailure::Retryable(format!("response read failed: {}", e)))?;

        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                AnalysisFailure::Permanent("response missing choices[0].message.content".to_string())
            })?;

        parse_vision_content(content)
    }
}

/// Parse the model's reply into a [`VisionOutput`].
///
/// Accepts `tags` as plain strings or as `{label, confidence}` objects,
/// tolerates a fenced ```json block, normalizes labels to trimmed
/// lowercase, and drops duplicates. Anything else is a permanent failure —
/// retrying an unparseable model is pointless.
pub fn parse_vision_content(content: &str) -> Result<VisionOutput, AnalysisFailure> {
    let trimmed = strip_code_fence(content);

    let json: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| AnalysisFailure::Permanent(format!("unparseable model output: {}", e)))?;

    let description = json
        .get("description")
        .and_then(|d| d.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AnalysisFailure::Permanent("model output missing description".to_string()))?;

    let mut tags: Vec<(String, Option<f64>)> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    if let Some(arr) = json.get("tags").and_then(|t| t.as_array()) {
        for item in arr {
            let (label, confidence) = match item {
                serde_json::Value::String(s) => (s.clone(), None),
                serde_json::Value::Object(obj) => {
                    let label = obj
                        .get("label")
                        .or_else(|| obj.get("tag"))
                        .and_then(|l| l.as_str())
                        .unwrap_or("")
                        .to_string();
                    let confidence = obj
                        .get("confidence")
                        .and_then(|c| c.as_f64())
                        .map(|c| c.clamp(0.0, 1.0));
                    (label, confidence)
                }
                _ => continue,
            };
            let label = label.trim().to_lowercase();
            if label.is_empty() || !seen.insert(label.clone()) {
                continue;
            }
            tags.push((label, confidence));
        }
    }

    Ok(VisionOutput { description, tags })
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(inner) = rest.strip_suffix("```") {
            return inner.trim();
        }
    }
    trimmed
}
