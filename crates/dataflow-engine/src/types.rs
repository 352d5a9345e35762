//! Core value types passed between nodes
//!
//! A node produces a [`NodeOutput`], which is either a JSON value or the
//! `Empty` sentinel used to short-circuit downstream work. Downstream nodes
//! see their declared parameters through [`NodeInputs`], and a finished
//! call is reported as an [`ExecutionResult`] keyed by node name.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of a node within a graph
pub type NodeName = String;

/// Output of a single node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum NodeOutput {
    /// The node produced a value
    Value(serde_json::Value),
    /// The node had no work to do
    Empty,
}

impl NodeOutput {
    /// Wrap anything convertible into a JSON value
    pub fn value(value: impl Into<serde_json::Value>) -> Self {
        Self::Value(value.into())
    }

    /// Serialize a typed value into an output
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::Value(serde_json::to_value(value)?))
    }

    /// Whether this is the `Empty` sentinel
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Borrow the JSON value, if any
    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Empty => None,
        }
    }

    /// Take the JSON value, if any
    pub fn into_value(self) -> Option<serde_json::Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Empty => None,
        }
    }

    /// Deserialize the value into `T`; `Empty` yields `None`
    pub fn parse<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        match self {
            Self::Value(v) => T::deserialize(v).map(Some),
            Self::Empty => Ok(None),
        }
    }
}

impl From<serde_json::Value> for NodeOutput {
    fn from(value: serde_json::Value) -> Self {
        Self::Value(value)
    }
}

/// Error reading a node's declared parameter
#[derive(Debug, Error)]
pub enum InputError {
    /// The parameter was not declared or not provided
    #[error("Node '{node}' has no input '{param}'")]
    Missing { node: String, param: String },

    /// The upstream node short-circuited
    #[error("Input '{param}' of node '{node}' is empty")]
    Empty { node: String, param: String },

    /// The value has the wrong shape
    #[error("Input '{param}' of node '{node}' is invalid: {source}")]
    Invalid {
        node: String,
        param: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Values a node receives for its declared parameters
///
/// Dependency parameters hold the upstream node's output; external
/// parameters hold the caller-supplied value wrapped in `NodeOutput::Value`.
#[derive(Debug, Clone, Default)]
pub struct NodeInputs {
    node: NodeName,
    values: HashMap<String, NodeOutput>,
}

impl NodeInputs {
    /// Create inputs for the named node
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            values: HashMap::new(),
        }
    }

    /// Add a parameter value
    pub fn with(mut self, param: impl Into<String>, value: NodeOutput) -> Self {
        self.insert(param, value);
        self
    }

    /// Set a parameter value
    pub fn insert(&mut self, param: impl Into<String>, value: NodeOutput) {
        self.values.insert(param.into(), value);
    }

    /// Name of the node receiving these inputs
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Raw output for a parameter
    pub fn get(&self, param: &str) -> Option<&NodeOutput> {
        self.values.get(param)
    }

    /// Whether a parameter is `Empty` (or absent)
    pub fn is_empty(&self, param: &str) -> bool {
        self.values.get(param).map_or(true, NodeOutput::is_empty)
    }

    /// Whether any parameter is `Empty`
    pub fn any_empty(&self) -> bool {
        self.values.values().any(NodeOutput::is_empty)
    }

    /// JSON value of a parameter; errors when absent or `Empty`
    pub fn value(&self, param: &str) -> Result<&serde_json::Value, InputError> {
        match self.values.get(param) {
            Some(NodeOutput::Value(v)) => Ok(v),
            Some(NodeOutput::Empty) => Err(InputError::Empty {
                node: self.node.clone(),
                param: param.to_string(),
            }),
            None => Err(InputError::Missing {
                node: self.node.clone(),
                param: param.to_string(),
            }),
        }
    }

    /// Deserialize a parameter into `T`
    pub fn parse<T: DeserializeOwned>(&self, param: &str) -> Result<T, InputError> {
        let value = self.value(param)?;
        T::deserialize(value).map_err(|source| InputError::Invalid {
            node: self.node.clone(),
            param: param.to_string(),
            source,
        })
    }

    /// Deserialize a parameter, treating `Empty` as `None`
    pub fn parse_optional<T: DeserializeOwned>(&self, param: &str) -> Result<Option<T>, InputError> {
        if self.is_empty(param) {
            return Ok(None);
        }
        self.parse(param).map(Some)
    }
}

/// Outputs of every node that ran during one call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    outputs: HashMap<NodeName, NodeOutput>,
}

impl ExecutionResult {
    /// Create an empty result
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: impl Into<String>, output: NodeOutput) {
        self.outputs.insert(node.into(), output);
    }

    /// Output of a node, if it ran
    pub fn get(&self, node: &str) -> Option<&NodeOutput> {
        self.outputs.get(node)
    }

    /// Whether the node ran
    pub fn contains(&self, node: &str) -> bool {
        self.outputs.contains_key(node)
    }

    /// Number of nodes that produced output
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Whether no node produced output
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Iterate over `(node, output)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &NodeOutput)> {
        self.outputs.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Names of the nodes that ran, sorted
    pub fn node_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.outputs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Keep only the named outputs
    pub fn select<S: AsRef<str>>(&self, nodes: &[S]) -> ExecutionResult {
        let outputs = nodes
            .iter()
            .filter_map(|name| {
                let name = name.as_ref();
                self.outputs
                    .get(name)
                    .map(|output| (name.to_string(), output.clone()))
            })
            .collect();
        ExecutionResult { outputs }
    }

    /// Consume into the underlying map
    pub fn into_map(self) -> HashMap<NodeName, NodeOutput> {
        self.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_output_parse() {
        let output = NodeOutput::value(json!({"count": 3}));
        let parsed: Option<HashMap<String, u32>> = output.parse().unwrap();
        assert_eq!(parsed.unwrap()["count"], 3);

        let empty: Option<u32> = NodeOutput::Empty.parse().unwrap();
        assert!(empty.is_none());
    }

    #[test]
    fn test_inputs_distinguish_empty_and_missing() {
        let inputs = NodeInputs::new("retrieval")
            .with("embedding", NodeOutput::Empty)
            .with("project_id", NodeOutput::value("p1"));

        assert!(inputs.is_empty("embedding"));
        assert!(inputs.is_empty("never_declared"));
        assert!(inputs.any_empty());
        assert!(matches!(
            inputs.value("embedding"),
            Err(InputError::Empty { .. })
        ));
        assert!(matches!(
            inputs.value("never_declared"),
            Err(InputError::Missing { .. })
        ));
        assert_eq!(inputs.parse::<String>("project_id").unwrap(), "p1");
    }

    #[test]
    fn test_inputs_invalid_shape() {
        let inputs = NodeInputs::new("n").with("count", NodeOutput::value("three"));
        let err = inputs.parse::<u64>("count").unwrap_err();
        assert!(matches!(err, InputError::Invalid { .. }));
        assert!(err.to_string().contains("count"));
    }

    #[test]
    fn test_parse_optional() {
        let inputs = NodeInputs::new("n")
            .with("a", NodeOutput::Empty)
            .with("b", NodeOutput::value(2));
        assert_eq!(inputs.parse_optional::<u32>("a").unwrap(), None);
        assert_eq!(inputs.parse_optional::<u32>("b").unwrap(), Some(2));
    }

    #[test]
    fn test_select_keeps_requested_only() {
        let mut result = ExecutionResult::new();
        result.insert("a", NodeOutput::value(1));
        result.insert("b", NodeOutput::Empty);
        result.insert("c", NodeOutput::value(3));

        let selected = result.select(&["c", "missing"]);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected.get("c"), Some(&NodeOutput::value(3)));
        assert_eq!(result.node_names(), vec!["a", "b", "c"]);
    }
}
