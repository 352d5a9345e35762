//! Async plan executor
//!
//! Runs an [`ExecutionPlan`] for one call. A node is dispatched as soon as
//! all of its dependencies have produced output, so independent nodes run
//! concurrently. Every node runs at most once per call.
//!
//! Node futures are polled inside the caller's task. Dropping the future
//! returned by [`Executor::execute`] (caller timeout or cancellation) drops
//! every in-flight node with it; nothing keeps running after the call
//! returns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use tokio::time::Instant;

use crate::error::{EngineError, NodeExecutionError, NodeFailure, Result};
use crate::events::{EventSink, NullEventSink, PipelineEvent};
use crate::graph::Node;
use crate::plan::ExecutionPlan;
use crate::types::{ExecutionResult, NodeInputs, NodeOutput};

/// Outcome of one dispatched node
struct NodeRun {
    index: usize,
    outcome: std::result::Result<NodeOutput, NodeFailure>,
    elapsed: Duration,
}

/// Executes a plan with per-call external inputs
///
/// The plan is shared; the executor holds no per-call state, so one
/// executor serves any number of concurrent calls.
#[derive(Clone)]
pub struct Executor {
    plan: Arc<ExecutionPlan>,
    node_timeout: Option<Duration>,
    event_sink: Arc<dyn EventSink>,
}

impl Executor {
    /// Create an executor for a plan
    pub fn new(plan: ExecutionPlan) -> Self {
        Self {
            plan: Arc::new(plan),
            node_timeout: None,
            event_sink: Arc::new(NullEventSink),
        }
    }

    /// Default time limit for every node without its own
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    /// Send instrumentation events to `sink`
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout
    }

    /// Execute the plan and return the outputs of every planned node
    pub async fn execute(
        &self,
        inputs: &HashMap<String, serde_json::Value>,
    ) -> Result<ExecutionResult> {
        let execution_id = format!("exec-{}", uuid::Uuid::new_v4());
        self.execute_with_id(inputs, &execution_id).await
    }

    /// Execute the plan and return only the requested outputs
    pub async fn execute_requested(
        &self,
        inputs: &HashMap<String, serde_json::Value>,
    ) -> Result<ExecutionResult> {
        let result = self.execute(inputs).await?;
        Ok(result.select(self.plan.requested()))
    }

    /// Execute the plan, tagging events with `execution_id`
    pub async fn execute_with_id(
        &self,
        inputs: &HashMap<String, serde_json::Value>,
        execution_id: &str,
    ) -> Result<ExecutionResult> {
        if let Some(missing) = self
            .plan
            .required_inputs()
            .iter()
            .find(|name| !inputs.contains_key(name.as_str()))
        {
            return Err(EngineError::MissingInput(missing.clone()));
        }

        let plan = &self.plan;
        let started = Instant::now();
        self.emit(PipelineEvent::ExecutionStarted {
            pipeline: plan.graph_name().to_string(),
            execution_id: execution_id.to_string(),
            node_count: plan.len(),
        });

        let mut pending: Vec<usize> = (0..plan.len())
            .map(|i| plan.dependencies_of(i).len())
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); plan.len()];
        for i in 0..plan.len() {
            for &dep in plan.dependencies_of(i) {
                dependents[dep].push(i);
            }
        }

        let mut result = ExecutionResult::new();
        let mut in_flight: FuturesUnordered<BoxFuture<'static, NodeRun>> = FuturesUnordered::new();

        for i in (0..plan.len()).filter(|&i| pending[i] == 0) {
            in_flight.push(self.dispatch(i, inputs, &result, execution_id));
        }

        while let Some(run) = in_flight.next().await {
            let node = &plan.nodes()[run.index];
            let elapsed_ms = run.elapsed.as_millis() as u64;

            match run.outcome {
                Ok(output) => {
                    self.emit(PipelineEvent::NodeCompleted {
                        node: node.name().to_string(),
                        execution_id: execution_id.to_string(),
                        elapsed_ms,
                        empty: output.is_empty(),
                    });
                    result.insert(node.name(), output);

                    for &next in &dependents[run.index] {
                        pending[next] -= 1;
                        if pending[next] == 0 {
                            in_flight.push(self.dispatch(next, inputs, &result, execution_id));
                        }
                    }
                }
                Err(failure) => {
                    let error = failure.to_string();
                    self.emit(PipelineEvent::NodeFailed {
                        node: node.name().to_string(),
                        execution_id: execution_id.to_string(),
                        error: error.clone(),
                        elapsed_ms,
                    });
                    self.emit(PipelineEvent::ExecutionFailed {
                        pipeline: plan.graph_name().to_string(),
                        execution_id: execution_id.to_string(),
                        node: node.name().to_string(),
                        error,
                    });
                    // Remaining siblings are dropped with `in_flight`
                    return Err(NodeExecutionError {
                        node: node.name().to_string(),
                        failure,
                        partial: result,
                    }
                    .into());
                }
            }
        }

        self.emit(PipelineEvent::ExecutionCompleted {
            pipeline: plan.graph_name().to_string(),
            execution_id: execution_id.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        });

        Ok(result)
    }

    /// Gather a node's inputs and start it
    fn dispatch(
        &self,
        index: usize,
        external: &HashMap<String, serde_json::Value>,
        result: &ExecutionResult,
        execution_id: &str,
    ) -> BoxFuture<'static, NodeRun> {
        let node: &Node = &self.plan.nodes()[index];

        let mut inputs = NodeInputs::new(node.name());
        for param in node.params() {
            if let Some(output) = result.get(param) {
                inputs.insert(param.clone(), output.clone());
            } else if let Some(value) = external.get(param) {
                inputs.insert(param.clone(), NodeOutput::Value(value.clone()));
            }
        }

        self.emit(PipelineEvent::NodeStarted {
            node: node.name().to_string(),
            execution_id: execution_id.to_string(),
        });
        log::debug!("Dispatching node '{}' ({})", node.name(), execution_id);

        let handler = node.handler();
        let limit = node.timeout().or(self.node_timeout);
        let timeout_as_empty = node.is_timeout_empty();

        async move {
            let started = Instant::now();
            let outcome = match limit {
                Some(limit) => match tokio::time::timeout(limit, handler.run(inputs)).await {
                    Ok(outcome) => outcome.map_err(NodeFailure::Error),
                    Err(_) if timeout_as_empty => Ok(NodeOutput::Empty),
                    Err(_) => Err(NodeFailure::Timeout {
                        elapsed: started.elapsed(),
                        limit,
                    }),
                },
                None => handler.run(inputs).await.map_err(NodeFailure::Error),
            };
            NodeRun {
                index,
                outcome,
                elapsed: started.elapsed(),
            }
        }
        .boxed()
    }

    fn emit(&self, event: PipelineEvent) {
        if let Err(e) = self.event_sink.send(event) {
            log::trace!("Dropped pipeline event: {}", e);
        }
    }
}

/// Execute `plan` once with default executor settings
pub async fn execute(
    plan: &ExecutionPlan,
    inputs: &HashMap<String, serde_json::Value>,
) -> Result<ExecutionResult> {
    Executor::new(plan.clone()).execute(inputs).await
}
