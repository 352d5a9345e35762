//! Node builders shared by the retrieval pipelines
//!
//! Each builder returns a [`Node`] wired to the standard names below. The
//! chain is `count_documents -> embedding -> retrieval -> filtered_documents`;
//! a zero count or an `Empty` upstream output short-circuits everything
//! after it without touching the embedder or retriever.

use std::sync::Arc;

use dataflow_engine::{BoxError, Node, NodeOutput, ScoreFilter, ScoredDocument};

use crate::pipeline::{Documents, PROJECT_ID, QUERY};
use crate::providers::{DocumentStore, Embedder, MetadataFilter, Retriever};

pub const COUNT_DOCUMENTS: &str = "count_documents";
pub const EMBEDDING: &str = "embedding";
pub const RETRIEVAL: &str = "retrieval";
pub const FILTERED_DOCUMENTS: &str = "filtered_documents";
pub const FORMATTED_OUTPUT: &str = "formatted_output";

/// Count the documents indexed for the request's project
pub fn count_documents(store: Arc<dyn DocumentStore>) -> Node {
    Node::from_async_fn(COUNT_DOCUMENTS, [PROJECT_ID], move |inputs| {
        let store = Arc::clone(&store);
        async move {
            let project_id: String = inputs.parse(PROJECT_ID)?;
            let count = store.count(&MetadataFilter::for_project(&project_id)).await?;
            log::debug!("{} documents indexed for project '{}'", count, project_id);
            Ok::<_, BoxError>(NodeOutput::value(count))
        }
    })
}

/// Whether the count output says there is something to retrieve
pub(crate) fn has_documents(inputs: &dataflow_engine::NodeInputs) -> Result<bool, BoxError> {
    let count: Option<u64> = inputs.parse_optional(COUNT_DOCUMENTS)?;
    Ok(count.unwrap_or(0) > 0)
}

/// Embed the query, or produce `Empty` when nothing is indexed
pub fn embedding(embedder: Arc<dyn Embedder>) -> Node {
    Node::from_async_fn(EMBEDDING, [COUNT_DOCUMENTS, QUERY], move |inputs| {
        let embedder = Arc::clone(&embedder);
        async move {
            if !has_documents(&inputs)? {
                return Ok(NodeOutput::Empty);
            }
            let query: String = inputs.parse(QUERY)?;
            let vector = embedder.embed(&query).await?;
            Ok::<_, BoxError>(NodeOutput::value(vector))
        }
    })
}

/// Vector search restricted by `base` plus the request's project
pub fn retrieval(retriever: Arc<dyn Retriever>, base: MetadataFilter) -> Node {
    Node::from_async_fn(RETRIEVAL, [EMBEDDING, PROJECT_ID], move |inputs| {
        let retriever = Arc::clone(&retriever);
        let base = base.clone();
        async move {
            let Some(vector) = inputs.parse_optional::<Vec<f32>>(EMBEDDING)? else {
                return Ok(NodeOutput::Empty);
            };
            let project_id: String = inputs.parse(PROJECT_ID)?;
            let filter = base.with_project(&project_id);
            let documents = retriever.search(Some(vector.as_slice()), &filter).await?;
            log::debug!("Retrieved {} candidates", documents.len());
            Ok::<_, BoxError>(NodeOutput::from_serialize(&Documents::new(documents))?)
        }
    })
}

/// Apply the score filter to the retrieved candidates
pub fn filtered_documents(filter: ScoreFilter) -> Node {
    Node::from_fn(FILTERED_DOCUMENTS, [RETRIEVAL], move |inputs| {
        let Some(retrieved) = inputs.parse_optional::<Documents<ScoredDocument>>(RETRIEVAL)? else {
            return Ok(NodeOutput::Empty);
        };
        let kept = filter.run(retrieved.documents);
        Ok(NodeOutput::from_serialize(&Documents::new(kept))?)
    })
}
