//! Nodes, pipeline graphs and the fluent graph builder
//!
//! Dependencies are declared explicitly: each node lists the parameter
//! names it reads, and a parameter that names another node is an edge.
//! Every other parameter must be one of the graph's declared external
//! inputs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{BoxError, GraphError};
use crate::types::{NodeInputs, NodeOutput};

/// The unit of work behind a node
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Compute the node's output from its declared parameters
    async fn run(&self, inputs: NodeInputs) -> Result<NodeOutput, BoxError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> NodeHandler for FnHandler<F>
where
    F: Fn(NodeInputs) -> Result<NodeOutput, BoxError> + Send + Sync,
{
    async fn run(&self, inputs: NodeInputs) -> Result<NodeOutput, BoxError> {
        (self.0)(inputs)
    }
}

struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F, Fut> NodeHandler for AsyncFnHandler<F>
where
    F: Fn(NodeInputs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NodeOutput, BoxError>> + Send,
{
    async fn run(&self, inputs: NodeInputs) -> Result<NodeOutput, BoxError> {
        (self.0)(inputs).await
    }
}

/// A named step with declared parameters
#[derive(Clone)]
pub struct Node {
    name: String,
    params: Vec<String>,
    handler: Arc<dyn NodeHandler>,
    timeout: Option<Duration>,
    timeout_as_empty: bool,
}

impl Node {
    /// Create a node from a handler
    pub fn new<I, S>(name: impl Into<String>, params: I, handler: impl NodeHandler + 'static) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            params: params.into_iter().map(Into::into).collect(),
            handler: Arc::new(handler),
            timeout: None,
            timeout_as_empty: false,
        }
    }

    /// Create a node from a synchronous closure
    pub fn from_fn<I, S, F>(name: impl Into<String>, params: I, f: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(NodeInputs) -> Result<NodeOutput, BoxError> + Send + Sync + 'static,
    {
        Self::new(name, params, FnHandler(f))
    }

    /// Create a node from an async closure
    pub fn from_async_fn<I, S, F, Fut>(name: impl Into<String>, params: I, f: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(NodeInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NodeOutput, BoxError>> + Send + 'static,
    {
        Self::new(name, params, AsyncFnHandler(f))
    }

    /// Bound this node's run time, overriding the executor default
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Produce `Empty` instead of failing when the time limit is hit
    pub fn timeout_as_empty(mut self) -> Self {
        self.timeout_as_empty = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_timeout_empty(&self) -> bool {
        self.timeout_as_empty
    }

    pub(crate) fn handler(&self) -> Arc<dyn NodeHandler> {
        Arc::clone(&self.handler)
    }

    /// Run the handler directly, outside any executor
    pub async fn run(&self, inputs: NodeInputs) -> Result<NodeOutput, BoxError> {
        self.handler.run(inputs).await
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("timeout", &self.timeout)
            .field("timeout_as_empty", &self.timeout_as_empty)
            .finish_non_exhaustive()
    }
}

/// A set of uniquely named nodes plus the external inputs they may read
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    name: String,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    external_inputs: Vec<String>,
}

impl PipelineGraph {
    /// Start building a graph
    pub fn builder(name: impl Into<String>) -> GraphBuilder {
        GraphBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Look up a node by name
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Declaration index of a node
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Declared external input names
    pub fn external_inputs(&self) -> &[String] {
        &self.external_inputs
    }

    pub fn is_external_input(&self, name: &str) -> bool {
        self.external_inputs.iter().any(|i| i == name)
    }

    /// Parameters of a node that name other nodes
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        let Some(node) = self.node(name) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        node.params
            .iter()
            .filter(|p| self.contains(p) && seen.insert(p.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Check the whole graph for unresolved parameters and cycles.
    ///
    /// Returns all errors found, not just the first. [`build_plan`] fails
    /// with the first of these.
    ///
    /// [`build_plan`]: crate::plan::build_plan
    pub fn validate(&self) -> Vec<GraphError> {
        let mut errors = Vec::new();

        for node in &self.nodes {
            for param in &node.params {
                if !self.contains(param) && !self.is_external_input(param) {
                    errors.push(GraphError::UnresolvedParameter {
                        node: node.name.clone(),
                        param: param.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm over every node
        let mut in_degree: Vec<usize> = self
            .nodes
            .iter()
            .map(|n| self.dependencies(&n.name).len())
            .collect();
        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut visited = 0;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            let name = self.nodes[i].name.as_str();
            for (j, node) in self.nodes.iter().enumerate() {
                if self.dependencies(&node.name).contains(&name) {
                    in_degree[j] -= 1;
                    if in_degree[j] == 0 {
                        queue.push_back(j);
                    }
                }
            }
        }

        if visited < self.nodes.len() {
            let stuck = self
                .nodes
                .iter()
                .zip(&in_degree)
                .filter(|(_, &deg)| deg > 0)
                .map(|(n, _)| n.name.clone())
                .collect();
            errors.push(GraphError::Cycle(stuck));
        }

        errors
    }
}

/// Fluent builder for pipeline graphs
///
/// # Example
///
/// ```ignore
/// let graph = PipelineGraph::builder("sql_pairs")
///     .input("query")
///     .node(Node::from_fn("upper", ["query"], |inputs| { ... }))
///     .build()?;
/// ```
pub struct GraphBuilder {
    name: String,
    nodes: Vec<Node>,
    external_inputs: Vec<String>,
}

impl GraphBuilder {
    /// Create a new graph builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            external_inputs: Vec::new(),
        }
    }

    /// Declare an external input name
    pub fn input(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.external_inputs.contains(&name) {
            self.external_inputs.push(name);
        }
        self
    }

    /// Declare several external input names
    pub fn inputs<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names.into_iter().fold(self, |b, name| b.input(name))
    }

    /// Add a node (declaration order is the tie-breaker for plans)
    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Build the graph, rejecting duplicate and shadowing names
    pub fn build(self) -> Result<PipelineGraph, GraphError> {
        let mut index = HashMap::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            if self.external_inputs.contains(&node.name) {
                return Err(GraphError::NodeShadowsInput(node.name.clone()));
            }
            if index.insert(node.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateNode(node.name.clone()));
            }
        }

        Ok(PipelineGraph {
            name: self.name,
            nodes: self.nodes,
            index,
            external_inputs: self.external_inputs,
        })
    }
}
