//! Retrieval of similar question/SQL pairs
//!
//! Nodes: `count_documents`, `embedding`, `retrieval`, `filtered_documents`
//! and `formatted_output`. The requested output is `formatted_output`,
//! shaped `{"documents": [{"question", "sql"}]}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dataflow_engine::{
    build_plan, EventSink, Executor, FilterConfig, GraphError, Node, NodeOutput, PipelineGraph,
    ScoreFilter, ScoredDocument,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::nodes::{self, FILTERED_DOCUMENTS, FORMATTED_OUTPUT};
use crate::pipeline::{
    run_executor, Documents, PipelineOutput, RetrievalPipeline, RetrievalRequest, PROJECT_ID, QUERY,
};
use crate::providers::{
    DocumentStore, DocumentStoreProvider, Embedder, EmbedderProvider, MetadataFilter, Retriever,
};

/// Dataset holding indexed question/SQL pairs
pub const DATASET: &str = "sql_pairs";

/// A formatted question/SQL pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlPair {
    pub question: String,
    pub sql: Option<String>,
}

impl From<ScoredDocument> for SqlPair {
    fn from(doc: ScoredDocument) -> Self {
        let sql = doc.meta_str("sql").map(str::to_string);
        Self {
            question: doc.content,
            sql,
        }
    }
}

/// Retrieves question/SQL pairs similar to the user's query
pub struct SqlPairsRetrieval {
    executor: Executor,
}

impl SqlPairsRetrieval {
    pub const NAME: &'static str = "SqlPairs Retrieval";

    /// Wire the pipeline from configured providers
    pub fn new(
        embedder_provider: &dyn EmbedderProvider,
        document_store_provider: &dyn DocumentStoreProvider,
        config: FilterConfig,
    ) -> Result<Self> {
        Self::from_parts(
            document_store_provider.get_store(DATASET),
            embedder_provider.get_text_embedder(),
            document_store_provider.get_retriever(DATASET),
            config,
        )
    }

    /// Wire the pipeline from individual collaborators
    pub fn from_parts(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn Embedder>,
        retriever: Arc<dyn Retriever>,
        config: FilterConfig,
    ) -> Result<Self> {
        config.validate()?;
        let graph = Self::graph(store, embedder, retriever, ScoreFilter::new(config))?;
        let plan = build_plan(&graph, &[FORMATTED_OUTPUT])?;
        Ok(Self {
            executor: Executor::new(plan),
        })
    }

    /// The node graph, before any output is requested
    pub fn graph(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn Embedder>,
        retriever: Arc<dyn Retriever>,
        filter: ScoreFilter,
    ) -> std::result::Result<PipelineGraph, GraphError> {
        PipelineGraph::builder("sql_pairs_retrieval")
            .inputs([QUERY, PROJECT_ID])
            .node(nodes::count_documents(store))
            .node(nodes::embedding(embedder))
            .node(nodes::retrieval(retriever, MetadataFilter::new()))
            .node(nodes::filtered_documents(filter))
            .node(formatted_output())
            .build()
    }

    /// Bound every node's run time
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.executor = self.executor.with_node_timeout(timeout);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.executor = self.executor.with_event_sink(sink);
        self
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}

#[async_trait]
impl RetrievalPipeline for SqlPairsRetrieval {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, request: &RetrievalRequest) -> Result<PipelineOutput> {
        log::info!("{} pipeline is running...", Self::NAME);
        run_executor(&self.executor, request).await
    }
}

fn formatted_output() -> Node {
    Node::from_fn(FORMATTED_OUTPUT, [FILTERED_DOCUMENTS], |inputs| {
        let filtered = inputs
            .parse_optional::<Documents<ScoredDocument>>(FILTERED_DOCUMENTS)?
            .unwrap_or_else(Documents::empty);
        let pairs: Vec<SqlPair> = filtered.documents.into_iter().map(SqlPair::from).collect();
        Ok(NodeOutput::from_serialize(&Documents::new(pairs))?)
    })
}
