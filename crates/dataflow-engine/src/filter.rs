//! Threshold and size bounded score filtering
//!
//! Retrievers return candidates sorted by descending score. The filter
//! keeps the candidates at or above a similarity threshold, in their
//! original order, and truncates to a maximum count.

use serde::{Deserialize, Serialize};

use crate::error::FilterConfigError;

/// Anything carrying a relevance score
pub trait Scored {
    fn score(&self) -> f32;
}

/// A retrieved document with its relevance score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    /// Document content
    pub content: String,
    /// Arbitrary metadata attached at indexing time
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
    /// Similarity score (0.0 to 1.0)
    pub score: f32,
}

impl ScoredDocument {
    pub fn new(content: impl Into<String>, score: f32) -> Self {
        Self {
            content: content.into(),
            meta: serde_json::Map::new(),
            score,
        }
    }

    /// Attach a metadata field
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Metadata field as a string, if present and a string
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(|v| v.as_str())
    }
}

impl Scored for ScoredDocument {
    fn score(&self) -> f32 {
        self.score
    }
}

/// Keep documents scoring at least `threshold`, then take the first `max_size`.
///
/// Output is an order-preserving subsequence of the input. Empty input,
/// or a threshold excluding every candidate, yields an empty vector.
pub fn filter_by_score<D: Scored>(documents: Vec<D>, threshold: f32, max_size: usize) -> Vec<D> {
    documents
        .into_iter()
        .filter(|d| d.score() >= threshold)
        .take(max_size)
        .collect()
}

/// Filter settings for one pipeline
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Minimum score to keep (0.0 to 1.0)
    pub threshold: f32,
    /// Maximum number of documents to keep (at least 1)
    pub max_size: usize,
}

impl FilterConfig {
    /// Create a validated config
    pub fn new(threshold: f32, max_size: usize) -> Result<Self, FilterConfigError> {
        let config = Self {
            threshold,
            max_size,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FilterConfigError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(FilterConfigError::Threshold(self.threshold));
        }
        if self.max_size == 0 {
            return Err(FilterConfigError::MaxSize);
        }
        Ok(())
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            max_size: 10,
        }
    }
}

/// Score filter bound to a config
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreFilter {
    config: FilterConfig,
}

impl ScoreFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> FilterConfig {
        self.config
    }

    pub fn run<D: Scored>(&self, documents: Vec<D>) -> Vec<D> {
        filter_by_score(documents, self.config.threshold, self.config.max_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(scores: &[f32]) -> Vec<ScoredDocument> {
        scores
            .iter()
            .enumerate()
            .map(|(i, &s)| ScoredDocument::new(format!("doc-{}", i), s))
            .collect()
    }

    fn scores(docs: &[ScoredDocument]) -> Vec<f32> {
        docs.iter().map(|d| d.score).collect()
    }

    #[test]
    fn test_threshold_then_truncate() {
        let kept = filter_by_score(docs(&[0.9, 0.8, 0.75, 0.5]), 0.7, 2);
        assert_eq!(scores(&kept), vec![0.9, 0.8]);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let kept = filter_by_score(docs(&[0.9, 0.7, 0.69]), 0.7, 10);
        assert_eq!(scores(&kept), vec![0.9, 0.7]);
    }

    #[test]
    fn test_empty_results_are_not_errors() {
        assert!(filter_by_score(Vec::<ScoredDocument>::new(), 0.5, 3).is_empty());
        assert!(filter_by_score(docs(&[0.4, 0.3]), 0.5, 3).is_empty());
    }

    #[test]
    fn test_nan_scores_are_dropped() {
        let kept = filter_by_score(docs(&[0.9, f32::NAN, 0.8]), 0.1, 10);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[1].content, "doc-2");
    }

    #[test]
    fn test_output_is_order_preserving_subsequence() {
        // Unsorted input is kept in input order
        let input = docs(&[0.2, 0.95, 0.6, 0.99, 0.7, 0.1, 0.85]);
        for threshold in [0.0, 0.5, 0.7, 0.9, 1.0] {
            for max_size in 1..=8 {
                let kept = filter_by_score(input.clone(), threshold, max_size);
                assert!(kept.len() <= max_size);
                assert!(kept.iter().all(|d| d.score >= threshold));

                let mut cursor = input.iter();
                for d in &kept {
                    assert!(cursor.any(|x| x == d), "not a subsequence");
                }
            }
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(FilterConfig::new(0.7, 2).is_ok());
        assert_eq!(FilterConfig::new(1.5, 2), Err(FilterConfigError::Threshold(1.5)));
        assert_eq!(FilterConfig::new(0.5, 0), Err(FilterConfigError::MaxSize));

        let filter = ScoreFilter::new(FilterConfig::new(0.7, 2).unwrap());
        assert_eq!(scores(&filter.run(docs(&[0.9, 0.8, 0.75]))), vec![0.9, 0.8]);
    }

    #[test]
    fn test_document_metadata() {
        let doc = ScoredDocument::new("What is revenue?", 0.8)
            .with_meta("sql", "SELECT sum(amount) FROM orders")
            .with_meta("project_id", "p1");
        assert_eq!(doc.meta_str("sql"), Some("SELECT sum(amount) FROM orders"));
        assert_eq!(doc.meta_str("missing"), None);
    }
}
