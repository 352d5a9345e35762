//! Dataflow Engine - on-demand execution of named computation steps
//!
//! Callers describe a pipeline as a graph of named nodes with explicitly
//! declared parameters, request a subset of outputs, and the engine runs
//! only the steps those outputs need. It provides:
//!
//! - Dependency resolution into a minimal, deterministic execution plan
//! - Async execution with concurrent dispatch of independent nodes
//! - An explicit `Empty` output for short-circuiting downstream work
//! - Per-node timeouts and failure reports carrying partial results
//! - A shared, size and time bounded result cache with single-flight misses
//! - Threshold/size bounded score filtering for ranked candidates
//!
//! # Example
//!
//! ```ignore
//! use dataflow_engine::{build_plan, Executor, Node, NodeOutput, PipelineGraph};
//!
//! let graph = PipelineGraph::builder("greeting")
//!     .input("name")
//!     .node(Node::from_fn("greet", ["name"], |inputs| {
//!         let name: String = inputs.parse("name")?;
//!         Ok(NodeOutput::value(format!("hello {}", name)))
//!     }))
//!     .build()?;
//!
//! let executor = Executor::new(build_plan(&graph, &["greet"])?);
//! let result = executor.execute(&inputs).await?;
//! ```

pub mod cache;
pub mod error;
pub mod events;
pub mod executor;
pub mod filter;
pub mod graph;
pub mod plan;
pub mod types;

// Re-export key types
pub use cache::{CacheEntry, CacheStats, CacheStore, KeyedCache, Lookup, LruStore, ResultCache};
pub use error::{
    BoxError, CacheUnavailable, EngineError, FilterConfigError, GraphError, NodeExecutionError,
    NodeFailure, Result,
};
pub use events::{EventError, EventSink, LogEventSink, NullEventSink, PipelineEvent, VecEventSink};
pub use executor::{execute, Executor};
pub use filter::{filter_by_score, FilterConfig, ScoreFilter, Scored, ScoredDocument};
pub use graph::{GraphBuilder, Node, NodeHandler, PipelineGraph};
pub use plan::{build_plan, ExecutionPlan};
pub use types::{ExecutionResult, InputError, NodeInputs, NodeName, NodeOutput};
