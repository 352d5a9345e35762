//! Shared request, output and pipeline types

use std::collections::HashMap;

use async_trait::async_trait;
use dataflow_engine::{ExecutionResult, Executor};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// External input carrying the user's question
pub const QUERY: &str = "query";
/// External input naming the tenant; may be empty
pub const PROJECT_ID: &str = "project_id";
/// External input naming the instruction scope
pub const SCOPE: &str = "scope";

/// Scope assumed for requests and documents that name none
pub const DEFAULT_SCOPE: &str = "sql";

/// Payload shape shared by retrieval nodes and formatted outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Documents<T> {
    pub documents: Vec<T>,
}

impl<T> Documents<T> {
    pub fn new(documents: Vec<T>) -> Self {
        Self { documents }
    }

    pub fn empty() -> Self {
        Self { documents: Vec::new() }
    }
}

/// One retrieval call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub query: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            project_id: None,
            scope: None,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Project id as the pipelines see it; absent means empty
    pub fn project_id(&self) -> &str {
        self.project_id.as_deref().unwrap_or_default()
    }

    pub fn scope(&self) -> &str {
        self.scope.as_deref().unwrap_or(DEFAULT_SCOPE)
    }

    /// External inputs for the executor
    pub fn to_inputs(&self) -> HashMap<String, serde_json::Value> {
        HashMap::from([
            (QUERY.to_string(), self.query.clone().into()),
            (PROJECT_ID.to_string(), self.project_id().into()),
            (SCOPE.to_string(), self.scope().into()),
        ])
    }
}

/// Requested outputs of one pipeline call, keyed by node name
///
/// A requested node that produced `Empty` maps to `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    outputs: HashMap<String, serde_json::Value>,
}

impl PipelineOutput {
    pub fn from_result(result: ExecutionResult) -> Self {
        let outputs = result
            .into_map()
            .into_iter()
            .map(|(name, output)| (name, output.into_value().unwrap_or(serde_json::Value::Null)))
            .collect();
        Self { outputs }
    }

    pub fn get(&self, node: &str) -> Option<&serde_json::Value> {
        self.outputs.get(node)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Decode the `documents` list of a requested output
    pub fn documents<T: DeserializeOwned>(&self, node: &str) -> Result<Vec<T>> {
        let Some(value) = self.outputs.get(node) else {
            return Ok(Vec::new());
        };
        if value.is_null() {
            return Ok(Vec::new());
        }
        Documents::<T>::deserialize(value)
            .map(|d| d.documents)
            .map_err(|source| PipelineError::MalformedOutput {
                node: node.to_string(),
                source,
            })
    }

    pub fn into_map(self) -> HashMap<String, serde_json::Value> {
        self.outputs
    }
}

/// A composed retrieval pipeline
#[async_trait]
pub trait RetrievalPipeline: Send + Sync {
    /// Display name used in logs
    fn name(&self) -> &str;

    /// Run once for `request`, returning the requested outputs
    async fn run(&self, request: &RetrievalRequest) -> Result<PipelineOutput>;
}

/// Execute a prepared plan for one request
pub(crate) async fn run_executor(
    executor: &Executor,
    request: &RetrievalRequest,
) -> Result<PipelineOutput> {
    let result = executor.execute_requested(&request.to_inputs()).await?;
    Ok(PipelineOutput::from_result(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_engine::NodeOutput;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let request = RetrievalRequest::new("top customers");
        assert_eq!(request.project_id(), "");
        assert_eq!(request.scope(), DEFAULT_SCOPE);

        let inputs = request.to_inputs();
        assert_eq!(inputs[QUERY], json!("top customers"));
        assert_eq!(inputs[PROJECT_ID], json!(""));
        assert_eq!(inputs[SCOPE], json!("sql"));
    }

    #[test]
    fn test_documents_decoding() {
        let mut result = ExecutionResult::new();
        result.insert("formatted_output", NodeOutput::value(json!({"documents": [1, 2]})));
        result.insert("skipped", NodeOutput::Empty);
        let output = PipelineOutput::from_result(result);

        assert_eq!(output.documents::<u32>("formatted_output").unwrap(), vec![1, 2]);
        assert_eq!(output.get("skipped"), Some(&serde_json::Value::Null));
        assert!(output.documents::<u32>("skipped").unwrap().is_empty());
        assert!(output.documents::<u32>("absent").unwrap().is_empty());
        assert!(matches!(
            output.documents::<String>("formatted_output"),
            Err(PipelineError::MalformedOutput { .. })
        ));
    }
}
