//! In-memory vector index over the analyzed corpus.
//!
//! One entry per fingerprint, rebuilt from the `embeddings` table at
//! startup and kept in sync by the pipeline and delete path. The metric
//! and dimensionality are fixed at build time; changing the embedding
//! backend requires a full reindex.
//!
//! Each entry snapshots the image's MIME type and tag labels so filters
//! can be applied before ranking. Scores sort descending; ties break
//! most-recent-insertion-first via a monotonic sequence number, which
//! keeps result order deterministic.

use std::collections::HashMap;

use crate::embedding::Metric;
use crate::errors::EngineError;

/// Optional pre-ranking filters for a search.
#[derive(Debug, Default, Clone)]
pub struct SearchFilters {
    /// Exact MIME match, e.g. `image/png`.
    pub mime: Option<String>,
    /// Entry must carry this tag label (any source).
    pub tag: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.mime.is_none() && self.tag.is_none()
    }
}

/// Metadata snapshotted into an entry at upsert time.
#[derive(Debug, Clone, Default)]
pub struct EntryMeta {
    pub mime: String,
    pub tags: Vec<String>,
}

struct Entry {
    vector: Vec<f32>,
    meta: EntryMeta,
    seq: u64,
}

pub struct VectorIndex {
    dims: usize,
    metric: Metric,
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl VectorIndex {
    pub fn new(dims: usize, metric: Metric) -> Self {
        Self {
            dims,
            metric,
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.entries.contains_key(fingerprint)
    }

    /// Insert or replace the entry for a fingerprint. There is never more
    /// than one live entry per fingerprint; a replace also refreshes the
    /// tie-break sequence.
    pub fn upsert(
        &mut self,
        fingerprint: &str,
        vector: Vec<f32>,
        meta: EntryMeta,
    ) -> Result<(), EngineError> {
        if vector.len() != self.dims {
            return Err(EngineError::DimensionMismatch {
                expected: self.dims,
                got: vector.len(),
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(fingerprint.to_string(), Entry { vector, meta, seq });
        Ok(())
    }

    /// Remove an entry. Removing an absent fingerprint is a no-op.
    pub fn remove(&mut self, fingerprint: &str) {
        self.entries.remove(fingerprint);
    }

    /// Refresh the metadata snapshot without touching the vector.
    /// No-op if the fingerprint has no entry yet.
    pub fn update_meta(&mut self, fingerprint: &str, meta: EntryMeta) {
        if let Some(entry) = self.entries.get_mut(fingerprint) {
            entry.meta = meta;
        }
    }

    /// Up to `k` nearest neighbors, descending by score, ties broken
    /// most-recent-insertion-first.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<(String, f32)>, EngineError> {
        if query.len() != self.dims {
            return Err(EngineError::DimensionMismatch {
                expected: self.dims,
                got: query.len(),
            });
        }

        let mut scored: Vec<(&String, f32, u64)> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                if let Some(ref mime) = filters.mime {
                    if &entry.meta.mime != mime {
                        return false;
                    }
                }
                if let Some(ref tag) = filters.tag {
                    if !entry.meta.tags.iter().any(|t| t == tag) {
                        return false;
                    }
                }
                true
            })
            .map(|(fp, entry)| (fp, self.metric.score(query, &entry.vector), entry.seq))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.2.cmp(&a.2))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(fp, score, _)| (fp.clone(), score))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(mime: &str, tags: &[&str]) -> EntryMeta {
        EntryMeta {
            mime: mime.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn index_with(entries: &[(&str, Vec<f32>)]) -> VectorIndex {
        let mut idx = VectorIndex::new(3, Metric::Cosine);
        for (fp, v) in entries {
            idx.upsert(fp, v.clone(), meta("image/png", &[])).unwrap();
        }
        idx
    }

    #[test]
    fn test_self_similarity_is_top_result() {
        let idx = index_with(&[
            ("a", vec![1.0, 0.0, 0.0]),
            ("b", vec![0.0, 1.0, 0.0]),
            ("c", vec![0.7, 0.7, 0.0]),
        ]);
        let results = idx.search(&[1.0, 0.0, 0.0], 1, &SearchFilters::default()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "a");
        assert!((results[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_upsert_replaces_never_duplicates() {
        let mut idx = index_with(&[("a", vec![1.0, 0.0, 0.0])]);
        idx.upsert("a", vec![0.0, 1.0, 0.0], meta("image/png", &[]))
            .unwrap();
        assert_eq!(idx.len(), 1);
        let results = idx.search(&[0.0, 1.0, 0.0], 5, &SearchFilters::default()).unwrap();
        assert_eq!(results[0].0, "a");
    }

    #[test]
    fn test_equal_scores_tie_break_most_recent_first() {
        let mut idx = VectorIndex::new(3, Metric::Cosine);
        // Identical vectors -> identical scores for any query
        idx.upsert("old", vec![1.0, 0.0, 0.0], meta("image/png", &[]))
            .unwrap();
        idx.upsert("new", vec![1.0, 0.0, 0.0], meta("image/png", &[]))
            .unwrap();
        let results = idx.search(&[1.0, 0.0, 0.0], 2, &SearchFilters::default()).unwrap();
        assert_eq!(results[0].0, "new");
        assert_eq!(results[1].0, "old");
    }

    #[test]
    fn test_remove_is_idempotent_and_hides_entry() {
        let mut idx = index_with(&[("a", vec![1.0, 0.0, 0.0])]);
        idx.remove("a");
        idx.remove("a");
        let results = idx.search(&[1.0, 0.0, 0.0], 5, &SearchFilters::default()).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_dimension_mismatch_on_upsert_and_search() {
        let mut idx = VectorIndex::new(3, Metric::Cosine);
        let err = idx.upsert("a", vec![1.0], meta("image/png", &[])).unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { expected: 3, got: 1 }));

        let err = idx.search(&[1.0, 2.0], 5, &SearchFilters::default()).unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { expected: 3, got: 2 }));
    }

    #[test]
    fn test_filters_applied_before_ranking() {
        let mut idx = VectorIndex::new(3, Metric::Cosine);
        idx.upsert("png", vec![1.0, 0.0, 0.0], meta("image/png", &["cat"]))
            .unwrap();
        idx.upsert("jpg", vec![1.0, 0.0, 0.0], meta("image/jpeg", &["dog"]))
            .unwrap();

        let results = idx
            .search(
                &[1.0, 0.0, 0.0],
                5,
                &SearchFilters {
                    mime: Some("image/jpeg".to_string()),
                    tag: None,
                },
            )
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "jpg");

        let results = idx
            .search(
                &[1.0, 0.0, 0.0],
                5,
                &SearchFilters {
                    mime: None,
                    tag: Some("cat".to_string()),
                },
            )
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "png");
    }

    #[test]
    fn test_k_truncation() {
        let idx = index_with(&[
            ("a", vec![1.0, 0.0, 0.0]),
            ("b", vec![0.9, 0.1, 0.0]),
            ("c", vec![0.0, 1.0, 0.0]),
        ]);
        let results = idx.search(&[1.0, 0.0, 0.0], 2, &SearchFilters::default()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "a");
        assert_eq!(results[1].0, "b");
    }

    #[test]
    fn test_dot_metric() {
        let mut idx = VectorIndex::new(2, Metric::Dot);
        idx.upsert("big", vec![2.0, 0.0], meta("image/png", &[])).unwrap();
        idx.upsert("small", vec![1.0, 0.0], meta("image/png", &[])).unwrap();
        let results = idx.search(&[1.0, 0.0], 2, &SearchFilters::default()).unwrap();
        // Dot product rewards magnitude
        assert_eq!(results[0].0, "big");
    }
}
