//! Dependency resolution
//!
//! Turns a graph plus a set of requested outputs into an [`ExecutionPlan`]:
//! exactly the transitive dependency closure of the requested nodes, in
//! topological order. Ties are broken by declaration order so the same
//! graph always yields the same plan. A graph with a cycle or an unresolved
//! parameter anywhere yields no plan at all.

use std::collections::{BTreeSet, HashMap};

use crate::error::GraphError;
use crate::graph::{Node, PipelineGraph};

/// A validated, ordered subset of a graph
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    graph_name: String,
    nodes: Vec<Node>,
    /// For each planned node, indices (into `nodes`) of its dependencies
    dependencies: Vec<Vec<usize>>,
    requested: Vec<String>,
    required_inputs: BTreeSet<String>,
}

impl ExecutionPlan {
    /// Name of the graph the plan was built from
    pub fn graph_name(&self) -> &str {
        &self.graph_name
    }

    /// Planned nodes in execution order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Planned node names in execution order
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(Node::name).collect()
    }

    /// Requested outputs, deduplicated, in request order
    pub fn requested(&self) -> &[String] {
        &self.requested
    }

    /// External inputs the caller must supply
    pub fn required_inputs(&self) -> &BTreeSet<String> {
        &self.required_inputs
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.name() == name)
    }

    pub(crate) fn dependencies_of(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }
}

/// Build the minimal execution plan for `requested` outputs.
///
/// The whole graph is validated first: any parameter that resolves to
/// neither a node nor an external input, or any cycle, fails the plan even
/// outside the requested closure. Unknown requested outputs fail with
/// [`GraphError::UnknownOutput`].
pub fn build_plan<S: AsRef<str>>(
    graph: &PipelineGraph,
    requested: &[S],
) -> Result<ExecutionPlan, GraphError> {
    if let Some(error) = graph.validate().into_iter().next() {
        return Err(error);
    }

    let mut wanted: Vec<String> = Vec::new();
    for name in requested {
        let name = name.as_ref();
        if !graph.contains(name) {
            return Err(GraphError::UnknownOutput(name.to_string()));
        }
        if !wanted.iter().any(|w| w == name) {
            wanted.push(name.to_string());
        }
    }
    if wanted.is_empty() {
        return Err(GraphError::NothingRequested);
    }

    // Transitive closure, keyed by declaration index
    let mut closure: BTreeSet<usize> = BTreeSet::new();
    let mut required_inputs = BTreeSet::new();
    let mut stack: Vec<usize> = wanted.iter().filter_map(|w| graph.position(w)).collect();

    while let Some(i) = stack.pop() {
        if !closure.insert(i) {
            continue;
        }
        let node = &graph.nodes()[i];
        for param in node.params() {
            if let Some(dep) = graph.position(param) {
                if !closure.contains(&dep) {
                    stack.push(dep);
                }
            } else if graph.is_external_input(param) {
                required_inputs.insert(param.clone());
            }
        }
    }

    // Kahn's algorithm; the ready set pops the lowest declaration index
    let deps: HashMap<usize, Vec<usize>> = closure
        .iter()
        .map(|&i| {
            let name = graph.nodes()[i].name();
            let ds = graph
                .dependencies(name)
                .into_iter()
                .filter_map(|d| graph.position(d))
                .collect();
            (i, ds)
        })
        .collect();

    let mut in_degree: HashMap<usize, usize> =
        deps.iter().map(|(&i, ds)| (i, ds.len())).collect();
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&i, _)| i)
        .collect();

    let mut order: Vec<usize> = Vec::with_capacity(closure.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for (&j, ds) in &deps {
            if ds.contains(&i) {
                if let Some(deg) = in_degree.get_mut(&j) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(j);
                    }
                }
            }
        }
    }

    if order.len() < closure.len() {
        let stuck = closure
            .iter()
            .filter(|i| !order.contains(i))
            .map(|&i| graph.nodes()[i].name().to_string())
            .collect();
        return Err(GraphError::Cycle(stuck));
    }

    let position_in_plan: HashMap<usize, usize> =
        order.iter().enumerate().map(|(p, &i)| (i, p)).collect();
    let dependencies = order
        .iter()
        .map(|i| deps[i].iter().map(|d| position_in_plan[d]).collect())
        .collect();
    let nodes = order.iter().map(|&i| graph.nodes()[i].clone()).collect();

    log::debug!(
        "Built plan for '{}': {} node(s) for {} requested output(s)",
        graph.name(),
        order.len(),
        wanted.len()
    );

    Ok(ExecutionPlan {
        graph_name: graph.name().to_string(),
        nodes,
        dependencies,
        requested: wanted,
        required_inputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeOutput;

    fn node(name: &str, params: &[&str]) -> Node {
        Node::from_fn(name, params.iter().copied(), |_| Ok(NodeOutput::Empty))
    }

    fn retrieval_graph() -> PipelineGraph {
        PipelineGraph::builder("retrieval")
            .inputs(["query", "project_id"])
            .node(node("count_documents", &["project_id"]))
            .node(node("embedding", &["count_documents", "query"]))
            .node(node("retrieval", &["embedding", "project_id"]))
            .node(node("filtered_documents", &["retrieval"]))
            .node(node("formatted_output", &["filtered_documents"]))
            .node(node("unrelated", &["query"]))
            .build()
            .unwrap()
    }

    #[test]
    fn test_plan_is_minimal_closure() {
        let graph = retrieval_graph();
        let plan = build_plan(&graph, &["formatted_output"]).unwrap();

        assert_eq!(
            plan.node_names(),
            vec![
                "count_documents",
                "embedding",
                "retrieval",
                "filtered_documents",
                "formatted_output"
            ]
        );
        assert!(!plan.contains("unrelated"));
        assert_eq!(
            plan.required_inputs().iter().collect::<Vec<_>>(),
            vec!["project_id", "query"]
        );
    }

    #[test]
    fn test_partial_request() {
        let graph = retrieval_graph();
        let plan = build_plan(&graph, &["embedding", "embedding"]).unwrap();
        assert_eq!(plan.node_names(), vec!["count_documents", "embedding"]);
        assert_eq!(plan.requested(), &["embedding".to_string()]);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        // c and b are independent; b is declared first
        let graph = PipelineGraph::builder("diamond")
            .node(node("d", &["c", "b"]))
            .node(node("b", &["a"]))
            .node(node("c", &["a"]))
            .node(node("a", &[]))
            .build()
            .unwrap();

        let plan = build_plan(&graph, &["d"]).unwrap();
        assert_eq!(plan.node_names(), vec!["a", "b", "c", "d"]);

        // Rebuilding yields the same order
        let again = build_plan(&graph, &["d"]).unwrap();
        assert_eq!(plan.node_names(), again.node_names());
    }

    #[test]
    fn test_every_node_follows_its_dependencies() {
        let graph = PipelineGraph::builder("wide")
            .input("x")
            .node(node("e", &["d", "b"]))
            .node(node("d", &["c"]))
            .node(node("c", &["a", "x"]))
            .node(node("b", &["a"]))
            .node(node("a", &["x"]))
            .build()
            .unwrap();

        let plan = build_plan(&graph, &["e"]).unwrap();
        let names = plan.node_names();
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
        for planned in plan.nodes() {
            for dep in graph.dependencies(planned.name()) {
                assert!(pos(dep) < pos(planned.name()));
            }
        }
        assert_eq!(plan.len(), 5);
    }

    #[test]
    fn test_unknown_output() {
        let graph = retrieval_graph();
        let err = build_plan(&graph, &["nope"]).unwrap_err();
        assert_eq!(err, GraphError::UnknownOutput("nope".to_string()));
    }

    #[test]
    fn test_nothing_requested() {
        let graph = retrieval_graph();
        let none: [&str; 0] = [];
        assert_eq!(build_plan(&graph, &none).unwrap_err(), GraphError::NothingRequested);
    }

    #[test]
    fn test_unresolved_parameter() {
        let graph = PipelineGraph::builder("g")
            .node(node("a", &["scope"]))
            .node(node("ok", &[]))
            .build()
            .unwrap();

        let unresolved = GraphError::UnresolvedParameter {
            node: "a".to_string(),
            param: "scope".to_string(),
        };
        assert_eq!(build_plan(&graph, &["a"]).unwrap_err(), unresolved);
        // Outside the requested closure too
        assert_eq!(build_plan(&graph, &["ok"]).unwrap_err(), unresolved);
    }

    #[test]
    fn test_miswired_graph_fails_for_any_request() {
        let graph = PipelineGraph::builder("g")
            .node(node("a", &["b"]))
            .node(node("b", &["a"]))
            .node(node("dangling", &["nowhere"]))
            .node(node("ok", &[]))
            .build()
            .unwrap();

        assert!(matches!(
            build_plan(&graph, &["ok"]),
            Err(GraphError::UnresolvedParameter { .. })
        ));
    }

    #[test]
    fn test_cycle_outside_closure_rejected() {
        let graph = PipelineGraph::builder("g")
            .node(node("a", &["b"]))
            .node(node("b", &["a"]))
            .node(node("ok", &[]))
            .build()
            .unwrap();

        assert_eq!(
            build_plan(&graph, &["ok"]).unwrap_err(),
            GraphError::Cycle(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_cycle_detected() {
        let graph = PipelineGraph::builder("cyclic")
            .node(node("a", &["c"]))
            .node(node("b", &["a"]))
            .node(node("c", &["b"]))
            .node(node("out", &["c"]))
            .build()
            .unwrap();

        match build_plan(&graph, &["out"]).unwrap_err() {
            GraphError::Cycle(nodes) => {
                assert!(nodes.contains(&"a".to_string()));
                assert!(nodes.contains(&"b".to_string()));
                assert!(nodes.contains(&"c".to_string()));
            }
            other => panic!("Expected Cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let graph = PipelineGraph::builder("g")
            .node(node("a", &["a"]))
            .build()
            .unwrap();
        assert_eq!(
            build_plan(&graph, &["a"]).unwrap_err(),
            GraphError::Cycle(vec!["a".to_string()])
        );
    }

    #[test]
    fn test_dependency_indices_point_into_plan() {
        let graph = retrieval_graph();
        let plan = build_plan(&graph, &["retrieval"]).unwrap();
        let retrieval = plan.node_names().iter().position(|n| *n == "retrieval").unwrap();
        let deps: Vec<&str> = plan
            .dependencies_of(retrieval)
            .iter()
            .map(|&d| plan.nodes()[d].name())
            .collect();
        assert_eq!(deps, vec!["embedding"]);
    }
}
