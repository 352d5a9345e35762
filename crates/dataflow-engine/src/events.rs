//! Instrumentation events for pipeline execution
//!
//! The executor reports the start, completion and failure of every node
//! through an [`EventSink`], so tracing backends can be attached without
//! touching node code.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Trait for receiving pipeline events
///
/// Sinks decide where events go (the log, a test buffer, a tracing
/// backend); the executor only reports them.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be delivered
    fn send(&self, event: PipelineEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone, Error)]
#[error("Event error: {message}")]
pub struct EventError {
    pub message: String,
}

/// Events emitted while executing a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PipelineEvent {
    /// A call to `execute` started
    #[serde(rename_all = "camelCase")]
    ExecutionStarted {
        pipeline: String,
        execution_id: String,
        node_count: usize,
    },

    /// A node was dispatched
    #[serde(rename_all = "camelCase")]
    NodeStarted { node: String, execution_id: String },

    /// A node finished successfully
    #[serde(rename_all = "camelCase")]
    NodeCompleted {
        node: String,
        execution_id: String,
        elapsed_ms: u64,
        /// The node returned the empty sentinel
        empty: bool,
    },

    /// A node failed
    #[serde(rename_all = "camelCase")]
    NodeFailed {
        node: String,
        execution_id: String,
        error: String,
        elapsed_ms: u64,
    },

    /// Every planned node finished
    #[serde(rename_all = "camelCase")]
    ExecutionCompleted {
        pipeline: String,
        execution_id: String,
        elapsed_ms: u64,
    },

    /// The call was aborted by a failing node
    #[serde(rename_all = "camelCase")]
    ExecutionFailed {
        pipeline: String,
        execution_id: String,
        node: String,
        error: String,
    },
}

impl PipelineEvent {
    /// Node the event refers to, if any
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node, .. }
            | Self::NodeCompleted { node, .. }
            | Self::NodeFailed { node, .. }
            | Self::ExecutionFailed { node, .. } => Some(node),
            Self::ExecutionStarted { .. } | Self::ExecutionCompleted { .. } => None,
        }
    }
}

/// A no-op event sink that discards all events
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: PipelineEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// Forwards events to the `log` facade at debug level
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn send(&self, event: PipelineEvent) -> Result<(), EventError> {
        match &event {
            PipelineEvent::NodeFailed { node, error, .. } => {
                log::warn!("Node '{}' failed: {}", node, error);
            }
            PipelineEvent::NodeCompleted {
                node,
                elapsed_ms,
                empty,
                ..
            } => {
                log::debug!("Node '{}' completed in {}ms (empty: {})", node, elapsed_ms, empty);
            }
            other => log::debug!("{:?}", other),
        }
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().clone()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: PipelineEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}
