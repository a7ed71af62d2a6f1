//! Core data models used throughout Pictor.
//!
//! These types represent the images, replication records, analysis tasks,
//! and tag assignments that flow through the ingestion and retrieval
//! pipeline. All timestamps are Unix epoch seconds, matching the SQLite
//! schema.

use serde::Serialize;

/// An immutable content blob, identified by the SHA-256 of its bytes.
///
/// Never mutated after creation; re-uploading different bytes produces a
/// different fingerprint and therefore a different object.
#[derive(Debug, Clone)]
pub struct ImageObject {
    /// Hex-encoded SHA-256 of the content.
    pub fingerprint: String,
    pub size_bytes: i64,
    /// MIME type sniffed from the bytes (e.g. `image/png`).
    pub mime: String,
    pub created_at: i64,
    /// AI-generated description from the most recent successful analysis.
    pub description: Option<String>,
}

/// Sync state of one (image, endpoint) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Pending,
    Synced,
    /// Terminal after the attempt budget is spent; surfaced via health,
    /// cleared only by a reconciliation pass or manual retry.
    Failed,
}

impl ReplicaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaState::Pending => "pending",
            ReplicaState::Synced => "synced",
            ReplicaState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReplicaState::Pending),
            "synced" => Some(ReplicaState::Synced),
            "failed" => Some(ReplicaState::Failed),
            _ => None,
        }
    }
}

/// Tracks replication of one image to one endpoint.
#[derive(Debug, Clone)]
pub struct ReplicationRecord {
    pub fingerprint: String,
    pub endpoint: String,
    pub state: ReplicaState,
    pub attempts: i64,
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
}

/// Lifecycle state of an [`AnalysisTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    InProgress,
    Succeeded,
    /// Failed but within the retry budget; requeued after backoff.
    FailedRetryable,
    /// Terminal failure. Not retried automatically.
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::InProgress => "in_progress",
            TaskState::Succeeded => "succeeded",
            TaskState::FailedRetryable => "failed_retryable",
            TaskState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskState::Queued),
            "in_progress" => Some(TaskState::InProgress),
            "succeeded" => Some(TaskState::Succeeded),
            "failed_retryable" => Some(TaskState::FailedRetryable),
            "failed" => Some(TaskState::Failed),
            _ => None,
        }
    }
}

/// One pending or in-flight AI analysis job for an image.
#[derive(Debug, Clone)]
pub struct AnalysisTask {
    pub id: String,
    pub fingerprint: String,
    pub state: TaskState,
    pub attempts: i64,
    /// Earliest time the task may be claimed again (backoff gate).
    pub next_attempt_at: i64,
    pub created_at: i64,
    pub last_error: Option<String>,
}

/// Who produced a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagSource {
    Ai,
    User,
}

impl TagSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagSource::Ai => "ai",
            TagSource::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ai" => Some(TagSource::Ai),
            "user" => Some(TagSource::User),
            _ => None,
        }
    }
}

/// A tag attached to an image. AI and user tags accumulate independently;
/// re-analysis replaces only the AI-sourced set.
#[derive(Debug, Clone, Serialize)]
pub struct TagAssignment {
    pub fingerprint: String,
    pub label: String,
    pub source: String,
    pub confidence: Option<f64>,
}

/// Parsed output of a vision model call.
#[derive(Debug, Clone)]
pub struct VisionOutput {
    pub description: String,
    /// Candidate tags with optional confidence in `[0, 1]`.
    pub tags: Vec<(String, Option<f64>)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_str_roundtrip() {
        for s in [
            TaskState::Queued,
            TaskState::InProgress,
            TaskState::Succeeded,
            TaskState::FailedRetryable,
            TaskState::Failed,
        ] {
            assert_eq!(TaskState::parse(s.as_str()), Some(s));
        }
        for s in [
            ReplicaState::Pending,
            ReplicaState::Synced,
            ReplicaState::Failed,
        ] {
            assert_eq!(ReplicaState::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskState::parse("bogus"), None);
    }
}
