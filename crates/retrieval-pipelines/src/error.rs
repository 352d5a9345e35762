//! Error types for retrieval pipelines

use dataflow_engine::{EngineError, FilterConfigError, GraphError};
use thiserror::Error;

/// Result type alias using PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised by external collaborators
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Counting documents failed
    #[error("Document store error: {0}")]
    Store(String),

    /// Embedding the query failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Vector search failed
    #[error("Retrieval error: {0}")]
    Retrieval(String),
}

/// Errors loading or validating settings
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Invalid setting '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Errors that can occur building or running a pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The node graph is miswired (construction time)
    #[error("Pipeline wiring error: {0}")]
    Graph(#[from] GraphError),

    /// Execution failed (call time)
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Filter thresholds are out of range
    #[error("Invalid filter configuration: {0}")]
    FilterConfig(#[from] FilterConfigError),

    /// Settings are invalid
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// A requested output did not have the expected shape
    #[error("Malformed output from '{node}': {source}")]
    MalformedOutput {
        node: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PipelineError {
    /// Name of the node that failed at call time, if any
    pub fn failed_node(&self) -> Option<&str> {
        match self {
            Self::Engine(e) => e.as_node_error().map(|n| n.node.as_str()),
            _ => None,
        }
    }

    /// Whether the call failed because a node timed out
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Engine(e) => e.as_node_error().is_some_and(|n| n.is_timeout()),
            _ => false,
        }
    }
}
