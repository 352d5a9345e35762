//! Error types for the dataflow engine

use std::time::Duration;

use thiserror::Error;

use crate::types::ExecutionResult;

/// Boxed error returned by node handlers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while building a graph or an execution plan.
///
/// These indicate a wiring defect and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Two nodes share the same name
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    /// A node uses the name of a declared external input
    #[error("Node '{0}' shadows an external input of the same name")]
    NodeShadowsInput(String),

    /// A requested output is not a node of the graph
    #[error("Requested output '{0}' is not a node in the graph")]
    UnknownOutput(String),

    /// A declared parameter is neither a node nor an external input
    #[error("Parameter '{param}' of node '{node}' matches no node and no external input")]
    UnresolvedParameter { node: String, param: String },

    /// The dependency edges form a cycle
    #[error("Cycle detected between nodes: {}", .0.join(", "))]
    Cycle(Vec<String>),

    /// No outputs were requested
    #[error("Execution plan requests no outputs")]
    NothingRequested,
}

/// Why a node failed during a call
#[derive(Debug, Error)]
pub enum NodeFailure {
    /// The node exceeded its time limit
    #[error("timed out after {elapsed:?} (limit {limit:?})")]
    Timeout { elapsed: Duration, limit: Duration },

    /// The node's handler returned an error
    #[error(transparent)]
    Error(BoxError),
}

/// A node failed at call time.
///
/// Carries the results of every node that completed before the failure.
#[derive(Debug, Error)]
#[error("Node '{node}' failed: {failure}")]
pub struct NodeExecutionError {
    /// Name of the failing node
    pub node: String,
    /// Underlying cause
    #[source]
    pub failure: NodeFailure,
    /// Results computed before the failure
    pub partial: ExecutionResult,
}

impl NodeExecutionError {
    /// Whether the node failed by exceeding its time limit
    pub fn is_timeout(&self) -> bool {
        matches!(self.failure, NodeFailure::Timeout { .. })
    }

    /// Time spent before the timeout fired, if this was a timeout
    pub fn timeout_elapsed(&self) -> Option<Duration> {
        match self.failure {
            NodeFailure::Timeout { elapsed, .. } => Some(elapsed),
            NodeFailure::Error(_) => None,
        }
    }
}

/// Errors that can occur in the dataflow engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Plan construction failed
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// The caller did not supply an external input the plan needs
    #[error("Missing required input: {0}")]
    MissingInput(String),

    /// A node failed during execution
    #[error(transparent)]
    NodeExecution(#[from] NodeExecutionError),
}

impl EngineError {
    /// The node execution error, if this is one
    pub fn as_node_error(&self) -> Option<&NodeExecutionError> {
        match self {
            Self::NodeExecution(err) => Some(err),
            _ => None,
        }
    }
}

/// The cache backing store could not be read or written.
///
/// The result cache treats this as a forced miss.
#[derive(Debug, Clone, Error)]
#[error("Cache unavailable: {0}")]
pub struct CacheUnavailable(pub String);

/// A score filter configuration is out of range
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterConfigError {
    #[error("Similarity threshold {0} is outside 0.0..=1.0")]
    Threshold(f32),

    #[error("Maximum result count must be at least 1")]
    MaxSize,
}
