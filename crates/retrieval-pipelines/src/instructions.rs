//! Retrieval of user instructions
//!
//! Extends the SQL-pairs chain with a scope filter and a
//! `default_instructions` node. Default instructions are fetched by
//! metadata alone, without an embedding, and precede the similarity
//! matches in `formatted_output`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dataflow_engine::{
    build_plan, BoxError, EventSink, Executor, FilterConfig, GraphError, Node, NodeOutput,
    PipelineGraph, ScoreFilter, ScoredDocument,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::nodes::{self, COUNT_DOCUMENTS, FILTERED_DOCUMENTS, FORMATTED_OUTPUT, RETRIEVAL};
use crate::pipeline::{
    run_executor, Documents, PipelineOutput, RetrievalPipeline, RetrievalRequest, DEFAULT_SCOPE,
    PROJECT_ID, QUERY, SCOPE,
};
use crate::providers::{
    DocumentStore, DocumentStoreProvider, Embedder, EmbedderProvider, MetadataFilter, Retriever,
};

/// Dataset holding indexed instructions
pub const DATASET: &str = "instructions";

pub const DEFAULT_INSTRUCTIONS: &str = "default_instructions";

/// Metadata flag separating always-applied instructions from matched ones
const IS_DEFAULT_FIELD: &str = "is_default";

/// A formatted instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub instruction: String,
    pub question: String,
    pub instruction_id: String,
}

impl From<ScoredDocument> for Instruction {
    fn from(doc: ScoredDocument) -> Self {
        Self {
            instruction: doc.meta_str("instruction").unwrap_or_default().to_string(),
            instruction_id: doc.meta_str("instruction_id").unwrap_or_default().to_string(),
            question: doc.content,
        }
    }
}

/// Keep documents whose `scope` metadata equals `scope`
///
/// Documents without a scope belong to the default scope.
pub fn filter_by_scope(documents: Vec<ScoredDocument>, scope: &str) -> Vec<ScoredDocument> {
    documents
        .into_iter()
        .filter(|d| d.meta_str("scope").unwrap_or(DEFAULT_SCOPE) == scope)
        .collect()
}

/// Retrieves instructions relevant to the user's query
pub struct InstructionsRetrieval {
    executor: Executor,
}

impl InstructionsRetrieval {
    pub const NAME: &'static str = "Instructions Retrieval";

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

    pub fn graph(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn Embedder>,
        retriever: Arc<dyn Retriever>,
        filter: ScoreFilter,
    ) -> std::result::Result<PipelineGraph, GraphError> {
        let matched = MetadataFilter::new().with_field(IS_DEFAULT_FIELD, false);
        PipelineGraph::builder("instructions_retrieval")
            .inputs([QUERY, PROJECT_ID, SCOPE])
            .node(nodes::count_documents(store))
            .node(nodes::embedding(embedder))
            .node(nodes::retrieval(Arc::clone(&retriever), matched))
            .node(filtered_documents(filter))
            .node(default_instructions(retriever))
            .node(formatted_output())
            .build()
    }

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
impl RetrievalPipeline for InstructionsRetrieval {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, request: &RetrievalRequest) -> Result<PipelineOutput> {
        log::info!("{} pipeline is running...", Self::NAME);
        run_executor(&self.executor, request).await
    }
}

fn filtered_documents(filter: ScoreFilter) -> Node {
    Node::from_fn(FILTERED_DOCUMENTS, [RETRIEVAL, SCOPE], move |inputs| {
        let Some(retrieved) = inputs.parse_optional::<Documents<ScoredDocument>>(RETRIEVAL)? else {
            return Ok(NodeOutput::Empty);
        };
        let scope: String = inputs.parse(SCOPE)?;
        let in_scope = filter_by_scope(retrieved.documents, &scope);
        Ok(NodeOutput::from_serialize(&Documents::new(filter.run(in_scope)))?)
    })
}

fn default_instructions(retriever: Arc<dyn Retriever>) -> Node {
    Node::from_async_fn(
        DEFAULT_INSTRUCTIONS,
        [COUNT_DOCUMENTS, PROJECT_ID, SCOPE],
        move |inputs| {
            let retriever = Arc::clone(&retriever);
            async move {
                if !nodes::has_documents(&inputs)? {
                    return Ok(NodeOutput::Empty);
                }
                let project_id: String = inputs.parse(PROJECT_ID)?;
                let scope: String = inputs.parse(SCOPE)?;
                let filter = MetadataFilter::new()
                    .with_field(IS_DEFAULT_FIELD, true)
                    .with_project(&project_id);
                let documents = retriever.search(None, &filter).await?;
                let in_scope = filter_by_scope(documents, &scope);
                Ok::<_, BoxError>(NodeOutput::from_serialize(&Documents::new(in_scope))?)
            }
        },
    )
}

fn formatted_output() -> Node {
    Node::from_fn(
        FORMATTED_OUTPUT,
        [DEFAULT_INSTRUCTIONS, FILTERED_DOCUMENTS],
        |inputs| {
            let defaults = inputs
                .parse_optional::<Documents<ScoredDocument>>(DEFAULT_INSTRUCTIONS)?
                .unwrap_or_else(Documents::empty);
            let matched = inputs
                .parse_optional::<Documents<ScoredDocument>>(FILTERED_DOCUMENTS)?
                .unwrap_or_else(Documents::empty);

            let merged: Vec<Instruction> = defaults
                .documents
                .into_iter()
                .chain(matched.documents)
                .map(Instruction::from)
                .collect();
            Ok(NodeOutput::from_serialize(&Documents::new(merged))?)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HashingEmbedder, InMemoryDocumentStore, InMemoryProvider};
    use serde_json::json;

    fn meta(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap()
    }

    fn provider() -> InMemoryProvider {
        let provider = InMemoryProvider::new(HashingEmbedder::new(64));
        provider.index(
            DATASET,
            "always use fiscal quarters",
            meta(json!({
                "project_id": "p1", "is_default": true,
                "instruction": "Quarters are fiscal", "instruction_id": "i-default"
            })),
        );
        provider.index(
            DATASET,
            "monthly revenue",
            meta(json!({
                "project_id": "p1", "is_default": false,
                "instruction": "Revenue excludes refunds", "instruction_id": "i-revenue"
            })),
        );
        provider.index(
            DATASET,
            "monthly revenue",
            meta(json!({
                "project_id": "p1", "is_default": false, "scope": "chart",
                "instruction": "Plot revenue as bars", "instruction_id": "i-chart"
            })),
        );
        provider.index(
            DATASET,
            "monthly revenue",
            meta(json!({
                "project_id": "p2", "is_default": false,
                "instruction": "Other tenant", "instruction_id": "i-other"
            })),
        );
        provider
    }

    #[test]
    fn test_scope_filter_defaults_to_sql() {
        let docs = vec![
            ScoredDocument::new("a", 0.9),
            ScoredDocument::new("b", 0.9).with_meta("scope", "chart"),
            ScoredDocument::new("c", 0.9).with_meta("scope", "sql"),
        ];
        let sql: Vec<String> = filter_by_scope(docs.clone(), "sql").into_iter().map(|d| d.content).collect();
        assert_eq!(sql, vec!["a", "c"]);
        assert_eq!(filter_by_scope(docs, "chart").len(), 1);
    }

    #[test]
    fn test_graph_is_well_formed() {
        let provider = provider();
        let graph = InstructionsRetrieval::graph(
            provider.get_store(DATASET),
            provider.get_text_embedder(),
            provider.get_retriever(DATASET),
            ScoreFilter::new(FilterConfig::default()),
        )
        .unwrap();
        assert!(graph.validate().is_empty());

        let plan = build_plan(&graph, &[FORMATTED_OUTPUT]).unwrap();
        assert_eq!(plan.len(), 6);
        assert!(plan.contains(DEFAULT_INSTRUCTIONS));
        let inputs: Vec<&str> = plan.required_inputs().iter().map(String::as_str).collect();
        assert_eq!(inputs, vec![PROJECT_ID, QUERY, SCOPE]);
    }

    #[tokio::test]
    async fn test_defaults_precede_matches() {
        let provider = provider();
        let pipeline = InstructionsRetrieval::new(&provider, &provider, FilterConfig::default()).unwrap();

        let output = pipeline
            .run(&RetrievalRequest::new("Monthly revenue").with_project("p1"))
            .await
            .unwrap();
        let instructions: Vec<Instruction> = output.documents(FORMATTED_OUTPUT).unwrap();
        let ids: Vec<&str> = instructions.iter().map(|i| i.instruction_id.as_str()).collect();

        assert_eq!(ids, vec!["i-default", "i-revenue"]);
        assert_eq!(instructions[0].question, "always use fiscal quarters");
        assert_eq!(instructions[1].instruction, "Revenue excludes refunds");
    }

    #[tokio::test]
    async fn test_scope_selects_instructions() {
        let provider = provider();
        let pipeline = InstructionsRetrieval::new(&provider, &provider, FilterConfig::default()).unwrap();

        let output = pipeline
            .run(&RetrievalRequest::new("monthly revenue").with_project("p1").with_scope("chart"))
            .await
            .unwrap();
        let instructions: Vec<Instruction> = output.documents(FORMATTED_OUTPUT).unwrap();

        // The default instruction has no scope, so it belongs to "sql"
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].instruction_id, "i-chart");
    }

    #[tokio::test]
    async fn test_unknown_project_short_circuits() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let embedder = Arc::new(HashingEmbedder::new(8));
        let pipeline = InstructionsRetrieval::from_parts(
            store.clone(),
            embedder.clone(),
            store.clone(),
            FilterConfig::default(),
        )
        .unwrap();

        let output = pipeline
            .run(&RetrievalRequest::new("anything").with_project("p1"))
            .await
            .unwrap();

        assert_eq!(output.get(FORMATTED_OUTPUT), Some(&json!({"documents": []})));
        assert_eq!(embedder.calls(), 0);
        assert_eq!(store.search_calls(), 0);
    }

    #[test]
    fn test_missing_metadata_formats_as_empty_strings() {
        let doc = ScoredDocument::new("bare", 0.9);
        assert_eq!(
            Instruction::from(doc),
            Instruction {
                instruction: String::new(),
                question: "bare".to_string(),
                instruction_id: String::new(),
            }
        );
    }
}
