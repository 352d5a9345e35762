//! Capability interfaces for external collaborators
//!
//! Pipelines reach document stores, embedders and retrievers only through
//! these traits. Provider traits construct the configured collaborators
//! for a named dataset.

use std::sync::Arc;

use async_trait::async_trait;
use dataflow_engine::ScoredDocument;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Metadata key holding the tenant/project a document belongs to
pub const PROJECT_ID_FIELD: &str = "project_id";

/// A single `field == value` condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub value: serde_json::Value,
}

/// Conjunction of equality conditions over document metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    conditions: Vec<Condition>,
}

impl MetadataFilter {
    /// A filter matching everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `field == value` condition
    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Restrict to a project; an empty project id adds no condition
    pub fn with_project(self, project_id: &str) -> Self {
        if project_id.is_empty() {
            self
        } else {
            self.with_field(PROJECT_ID_FIELD, project_id)
        }
    }

    /// Filter for a single project
    pub fn for_project(project_id: &str) -> Self {
        Self::new().with_project(project_id)
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Whether every condition holds for `meta`
    pub fn matches(&self, meta: &serde_json::Map<String, serde_json::Value>) -> bool {
        self.conditions
            .iter()
            .all(|c| meta.get(&c.field) == Some(&c.value))
    }

    /// Store-neutral JSON form: `{"operator": "AND", "conditions": [...]}`.
    ///
    /// Returns `None` for a filter without conditions.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        if self.conditions.is_empty() {
            return None;
        }
        let conditions: Vec<serde_json::Value> = self
            .conditions
            .iter()
            .map(|c| serde_json::json!({"field": c.field, "operator": "==", "value": c.value}))
            .collect();
        Some(serde_json::json!({"operator": "AND", "conditions": conditions}))
    }
}

/// Counts indexed documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn count(&self, filter: &MetadataFilter) -> Result<u64, ProviderError>;
}

/// Turns text into a vector
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

/// Ranked search over a document store
///
/// Results are ordered by descending score. Without a query vector the
/// retriever returns every document matching `filter`.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn search(
        &self,
        embedding: Option<&[f32]>,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredDocument>, ProviderError>;
}

/// Constructs document stores and retrievers per dataset
pub trait DocumentStoreProvider: Send + Sync {
    fn get_store(&self, dataset: &str) -> Arc<dyn DocumentStore>;
    fn get_retriever(&self, dataset: &str) -> Arc<dyn Retriever>;
}

/// Constructs the configured text embedder
pub trait EmbedderProvider: Send + Sync {
    fn get_text_embedder(&self) -> Arc<dyn Embedder>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_empty_project_adds_no_condition() {
        assert!(MetadataFilter::for_project("").is_empty());
        assert!(MetadataFilter::for_project("").to_json().is_none());
        assert_eq!(MetadataFilter::for_project("p1").conditions().len(), 1);
    }

    #[test]
    fn test_matches_all_conditions() {
        let filter = MetadataFilter::new().with_field("is_default", false).with_project("p1");
        assert!(filter.matches(&meta(json!({"project_id": "p1", "is_default": false}))));
        assert!(!filter.matches(&meta(json!({"project_id": "p2", "is_default": false}))));
        assert!(!filter.matches(&meta(json!({"project_id": "p1"}))));
        assert!(MetadataFilter::new().matches(&meta(json!({}))));
    }

    #[test]
    fn test_json_form() {
        let filter = MetadataFilter::for_project("p1");
        assert_eq!(
            filter.to_json().unwrap(),
            json!({
                "operator": "AND",
                "conditions": [{"field": "project_id", "operator": "==", "value": "p1"}]
            })
        );
    }
}
