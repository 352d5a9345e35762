//! In-process collaborators
//!
//! `InMemoryDocumentStore` keeps documents with their vectors and ranks by
//! cosine similarity. `HashingEmbedder` maps text to a fixed-size vector by
//! hashing its tokens, so identical text always embeds identically. Both
//! count their calls, which is how tests observe short-circuiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dataflow_engine::ScoredDocument;
use parking_lot::RwLock;

use crate::error::ProviderError;
use crate::providers::{
    DocumentStore, DocumentStoreProvider, Embedder, EmbedderProvider, MetadataFilter, Retriever,
};

/// Default vector width for [`HashingEmbedder`]
pub const DEFAULT_DIMENSIONS: usize = 256;

/// A document held by [`InMemoryDocumentStore`]
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub content: String,
    pub meta: serde_json::Map<String, serde_json::Value>,
    pub embedding: Vec<f32>,
}

impl StoredDocument {
    pub fn new(content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            content: content.into(),
            meta: serde_json::Map::new(),
            embedding,
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

/// Document store and retriever backed by a vector in memory
#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<Vec<StoredDocument>>,
    count_calls: AtomicUsize,
    search_calls: AtomicUsize,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: StoredDocument) {
        self.documents.write().push(document);
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Remove every document matching `filter`; returns how many were removed
    pub fn delete(&self, filter: &MetadataFilter) -> usize {
        let mut documents = self.documents.write();
        let before = documents.len();
        documents.retain(|d| !filter.matches(&d.meta));
        before - documents.len()
    }

    /// Number of `count` calls served
    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }

    /// Number of `search` calls served
    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn count(&self, filter: &MetadataFilter) -> Result<u64, ProviderError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        let count = self
            .documents
            .read()
            .iter()
            .filter(|d| filter.matches(&d.meta))
            .count();
        Ok(count as u64)
    }
}

#[async_trait]
impl Retriever for InMemoryDocumentStore {
    async fn search(
        &self,
        embedding: Option<&[f32]>,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredDocument>, ProviderError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let documents = self.documents.read();

        let mut results = Vec::new();
        for doc in documents.iter().filter(|d| filter.matches(&d.meta)) {
            let score = match embedding {
                Some(query) => {
                    if query.len() != doc.embedding.len() {
                        return Err(ProviderError::Retrieval(format!(
                            "dimension mismatch: query has {}, document has {}",
                            query.len(),
                            doc.embedding.len()
                        )));
                    }
                    cosine_similarity(query, &doc.embedding)
                }
                // Filter-only lookups are exact matches
                None => 1.0,
            };
            results.push(ScoredDocument {
                content: doc.content.clone(),
                meta: doc.meta.clone(),
                score,
            });
        }

        // Stable sort keeps insertion order among equal scores
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(results)
    }
}

/// Cosine similarity of two equal-length vectors; 0.0 if either is zero
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Deterministic bag-of-words embedder
pub struct HashingEmbedder {
    dimensions: usize,
    calls: AtomicUsize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of `embed` calls served
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Embed without counting a call
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(&token.to_lowercase());
            vector[(hash % self.dimensions as u64) as usize] += 1.0;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.embed_sync(text))
    }
}

fn fnv1a(text: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Provider handing out in-memory stores per dataset and a shared embedder
pub struct InMemoryProvider {
    embedder: Arc<HashingEmbedder>,
    datasets: RwLock<HashMap<String, Arc<InMemoryDocumentStore>>>,
}

impl InMemoryProvider {
    pub fn new(embedder: HashingEmbedder) -> Self {
        Self {
            embedder: Arc::new(embedder),
            datasets: RwLock::new(HashMap::new()),
        }
    }

    pub fn embedder(&self) -> Arc<HashingEmbedder> {
        Arc::clone(&self.embedder)
    }

    /// The store for `dataset`, created on first use
    pub fn dataset(&self, dataset: &str) -> Arc<InMemoryDocumentStore> {
        if let Some(store) = self.datasets.read().get(dataset) {
            return Arc::clone(store);
        }
        let mut datasets = self.datasets.write();
        Arc::clone(
            datasets
                .entry(dataset.to_string())
                .or_insert_with(|| Arc::new(InMemoryDocumentStore::new())),
        )
    }

    /// Embed `content` and add it to `dataset`
    pub fn index(
        &self,
        dataset: &str,
        content: &str,
        meta: serde_json::Map<String, serde_json::Value>,
    ) {
        let mut document = StoredDocument::new(content, self.embedder.embed_sync(content));
        document.meta = meta;
        self.dataset(dataset).insert(document);
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new(HashingEmbedder::default())
    }
}

impl DocumentStoreProvider for InMemoryProvider {
    fn get_store(&self, dataset: &str) -> Arc<dyn DocumentStore> {
        self.dataset(dataset)
    }

    fn get_retriever(&self, dataset: &str) -> Arc<dyn Retriever> {
        self.dataset(dataset)
    }
}

impl EmbedderProvider for InMemoryProvider {
    fn get_text_embedder(&self) -> Arc<dyn Embedder> {
        self.embedder()
    }
}
