//! Cached retrieval services

use std::time::Duration;

use dataflow_engine::{CacheStats, KeyedCache, ResultCache};

use crate::error::Result;
use crate::pipeline::{PipelineOutput, RetrievalPipeline, RetrievalRequest};

/// Cache identity of a request
///
/// An absent project id and an empty one select the same documents, so
/// both normalize to `""`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub query: String,
    pub project_id: String,
    pub scope: String,
}

impl From<&RetrievalRequest> for RequestKey {
    fn from(request: &RetrievalRequest) -> Self {
        Self {
            query: request.query.clone(),
            project_id: request.project_id().to_string(),
            scope: request.scope().to_string(),
        }
    }
}

/// A pipeline behind a request-scoped result cache
///
/// Repeated requests within the TTL return the stored output without
/// running any node. Failed runs are never cached.
pub struct RetrievalService<P> {
    pipeline: P,
    cache: KeyedCache<RetrievalRequest, RequestKey, PipelineOutput>,
}

impl<P: RetrievalPipeline> RetrievalService<P> {
    pub fn new(pipeline: P, maxsize: usize, ttl: Duration) -> Self {
        Self::with_cache(pipeline, ResultCache::new(maxsize, ttl))
    }

    /// Use a caller-built cache, e.g. one over a custom store
    pub fn with_cache(pipeline: P, cache: ResultCache<RequestKey, PipelineOutput>) -> Self {
        Self {
            pipeline,
            cache: KeyedCache::new(cache, |request: &RetrievalRequest| RequestKey::from(request)),
        }
    }

    pub async fn run(&self, request: &RetrievalRequest) -> Result<PipelineOutput> {
        self.cache
            .get_or_compute(request, || self.pipeline.run(request))
            .await
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.cache().stats()
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        self.cache.cache().purge_expired()
    }

    pub fn clear_cache(&self) {
        self.cache.cache().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HashingEmbedder, InMemoryDocumentStore, StoredDocument};
    use crate::nodes::FORMATTED_OUTPUT;
    use crate::sql_pairs::{SqlPair, SqlPairsRetrieval};
    use dataflow_engine::{CacheStore, CacheUnavailable, FilterConfig, Lookup};
    use std::sync::Arc;

    struct Fixture {
        store: Arc<InMemoryDocumentStore>,
        embedder: Arc<HashingEmbedder>,
    }

    impl Fixture {
        fn new() -> Self {
            let embedder = Arc::new(HashingEmbedder::new(32));
            let store = Arc::new(InMemoryDocumentStore::new());
            store.insert(
                StoredDocument::new("top customers", embedder.embed_sync("top customers"))
                    .with_meta("project_id", "p1")
                    .with_meta("sql", "SELECT * FROM customers"),
            );
            Self { store, embedder }
        }

        fn pipeline(&self) -> SqlPairsRetrieval {
            SqlPairsRetrieval::from_parts(
                self.store.clone(),
                self.embedder.clone(),
                self.store.clone(),
                FilterConfig::default(),
            )
            .unwrap()
        }
    }

    #[tokio::test]
    async fn test_repeat_request_served_from_cache() {
        let fixture = Fixture::new();
        let service = RetrievalService::new(fixture.pipeline(), 10, Duration::from_secs(60));
        let request = RetrievalRequest::new("top customers").with_project("p1");

        let first = service.run(&request).await.unwrap();
        let second = service.run(&request).await.unwrap();

        assert_eq!(first, second);
        let pairs: Vec<SqlPair> = first.documents(FORMATTED_OUTPUT).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(fixture.embedder.calls(), 1);
        assert_eq!(fixture.store.count_calls(), 1);
        let stats = service.cache_stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn test_distinct_keys_miss() {
        let fixture = Fixture::new();
        let service = RetrievalService::new(fixture.pipeline(), 10, Duration::from_secs(60));

        service.run(&RetrievalRequest::new("top customers").with_project("p1")).await.unwrap();
        service.run(&RetrievalRequest::new("top customers").with_project("p2")).await.unwrap();
        service
            .run(&RetrievalRequest::new("top customers").with_project("p1").with_scope("chart"))
            .await
            .unwrap();

        assert_eq!(fixture.store.count_calls(), 3);
        assert_eq!(service.cache_stats().entries, 3);
    }

    #[tokio::test]
    async fn test_absent_and_empty_project_share_entry() {
        let fixture = Fixture::new();
        let service = RetrievalService::new(fixture.pipeline(), 10, Duration::from_secs(60));

        service.run(&RetrievalRequest::new("q")).await.unwrap();
        service.run(&RetrievalRequest::new("q").with_project("")).await.unwrap();

        assert_eq!(fixture.store.count_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let fixture = Fixture::new();
        let service = RetrievalService::new(fixture.pipeline(), 10, Duration::from_secs(60));
        let request = RetrievalRequest::new("top customers").with_project("p1");

        service.run(&request).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        service.run(&request).await.unwrap();

        assert_eq!(fixture.store.count_calls(), 2);
        assert_eq!(service.purge_expired(), 0);
    }

    struct DownStore;

    impl CacheStore<RequestKey, PipelineOutput> for DownStore {
        fn get(
            &self,
            _key: &RequestKey,
            _now: tokio::time::Instant,
        ) -> std::result::Result<Lookup<PipelineOutput>, CacheUnavailable> {
            Err(CacheUnavailable("store offline".to_string()))
        }

        fn insert(
            &self,
            _key: RequestKey,
            _value: PipelineOutput,
            _now: tokio::time::Instant,
        ) -> std::result::Result<usize, CacheUnavailable> {
            Err(CacheUnavailable("store offline".to_string()))
        }

        fn purge_expired(
            &self,
            _now: tokio::time::Instant,
        ) -> std::result::Result<usize, CacheUnavailable> {
            Err(CacheUnavailable("store offline".to_string()))
        }

        fn len(&self) -> usize {
            0
        }

        fn clear(&self) {}
    }

    #[tokio::test]
    async fn test_unavailable_cache_degrades_to_miss() {
        let fixture = Fixture::new();
        let service = RetrievalService::with_cache(
            fixture.pipeline(),
            ResultCache::with_store(Arc::new(DownStore)),
        );
        let request = RetrievalRequest::new("top customers").with_project("p1");

        assert!(service.run(&request).await.is_ok());
        assert!(service.run(&request).await.is_ok());

        assert_eq!(fixture.store.count_calls(), 2);
        assert_eq!(service.cache_stats().degraded, 2);
    }
}
