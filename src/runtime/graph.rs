/// Graph traversal over a version's nodes and edges
///
/// Runtime execution order is decided live by branch outputs, so these helpers
/// work on plain slices: locating the entry node, picking successors for a
/// branch handle, and static validation. `get_execution_order` builds a
/// petgraph DAG for tooling only.

use crate::error::GraphError;
use crate::workflow::types::{Edge, Node};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};

/// Substrings that mark a node type as trigger-like when no explicit flag is set
const TRIGGER_HINTS: [&str; 6] = ["trigger", "message", "received", "created", "added", "call"];

/// Result of static graph validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphValidation {
    pub valid: bool,
    pub errors: Vec<GraphError>,
}

/// Locate the entry node for a run
///
/// Precedence: exact `event_type` match, then an explicit `is_trigger` flag,
/// then the type-name heuristic, then the first declared node.
pub fn find_trigger_node<'a>(nodes: &'a [Node], event_type: Option<&str>) -> Option<&'a Node> {
    if let Some(event_type) = event_type {
        if let Some(node) = nodes.iter().find(|node| node.node_type == event_type) {
            return Some(node);
        }
    }

    nodes
        .iter()
        .find(|node| node.is_trigger)
        .or_else(|| nodes.iter().find(|node| looks_like_trigger(&node.node_type)))
        .or_else(|| nodes.first())
}

/// Deprecated fallback: infer trigger nodes from their type name
pub fn looks_like_trigger(node_type: &str) -> bool {
    TRIGGER_HINTS.iter().any(|hint| node_type.contains(hint))
}

/// Target ids of the edges leaving `current_node_id`, in edge order
///
/// With a handle, only edges tagged with exactly that handle are followed.
pub fn find_next_nodes(current_node_id: &str, edges: &[Edge], source_handle: Option<&str>) -> Vec<String> {
    edges
        .iter()
        .filter(|edge| edge.source == current_node_id)
        .filter(|edge| match source_handle {
            Some(handle) => edge.source_handle.as_deref() == Some(handle),
            None => true,
        })
        .map(|edge| edge.target.clone())
        .collect()
}

pub fn is_branching_node(node: &Node) -> bool {
    matches!(node.node_type.as_str(), "if_else" | "switch" | "loop")
}

/// Output handles a node can emit
///
/// Switch cases may be plain strings or objects carrying `handle` or `value`.
pub fn get_branch_handles(node: &Node) -> Vec<String> {
    match node.node_type.as_str() {
        "if_else" => vec!["true".to_string(), "false".to_string()],
        "loop" => vec!["item".to_string(), "done".to_string()],
        "switch" => {
            let mut handles: Vec<String> = node
                .config
                .get("cases")
                .and_then(|cases| cases.as_array())
                .map(|cases| cases.iter().filter_map(case_handle).collect())
                .unwrap_or_default();
            handles.push("default".to_string());
            handles
        }
        _ => vec!["output".to_string()],
    }
}

/// Handle name of a single switch case definition
pub fn case_handle(case: &serde_json::Value) -> Option<String> {
    match case {
        serde_json::Value::String(name) => Some(name.clone()),
        serde_json::Value::Object(fields) => fields
            .get("handle")
            .or_else(|| fields.get("value"))
            .map(crate::runtime::context::stringify),
        _ => None,
    }
}

/// Kahn's-algorithm topological order
///
/// Zero in-degree nodes are seeded in declaration order and successors are
/// released in edge order. Nodes on a cycle never reach zero in-degree and are
/// left out; edges to unknown ids are ignored.
pub fn get_execution_order<'a>(nodes: &'a [Node], edges: &[Edge]) -> Vec<&'a Node> {
    let mut graph: DiGraph<&Node, ()> = DiGraph::new();
    let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();

    for node in nodes {
        let index = graph.add_node(node);
        index_of.insert(node.id.as_str(), index);
    }

    for edge in edges {
        if let (Some(from), Some(to)) = (index_of.get(edge.source.as_str()), index_of.get(edge.target.as_str())) {
            graph.add_edge(*from, *to, ());
        }
    }

    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|index| graph.neighbors_directed(index, petgraph::Direction::Incoming).count())
        .collect();

    let mut queue: VecDeque<NodeIndex> = graph.node_indices().filter(|index| in_degree[index.index()] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(index) = queue.pop_front() {
        order.push(graph[index]);

        // petgraph walks outgoing edges newest-first
        let mut successors: Vec<NodeIndex> = graph.neighbors(index).collect();
        successors.reverse();

        for successor in successors {
            let degree = &mut in_degree[successor.index()];
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(successor);
            }
        }
    }

    order
}

/// Static well-formedness check
///
/// Requires exactly one trigger (explicit flags when any node carries one,
/// otherwise the type-name heuristic), flags non-trigger nodes with no edges,
/// and flags edges that reference unknown node ids.
pub fn validate_graph(nodes: &[Node], edges: &[Edge]) -> GraphValidation {
    let mut errors = Vec::new();

    let flagged: Vec<&Node> = nodes.iter().filter(|node| node.is_trigger).collect();
    let triggers = if flagged.is_empty() {
        nodes.iter().filter(|node| looks_like_trigger(&node.node_type)).collect()
    } else {
        flagged
    };

    match triggers.len() {
        0 => errors.push(GraphError::MissingTrigger),
        1 => {}
        _ => errors.push(GraphError::MultipleTriggers(
            triggers.iter().map(|node| node.id.clone()).collect(),
        )),
    }

    let known: HashSet<&str> = nodes.iter().map(|node| node.id.as_str()).collect();
    let trigger_ids: HashSet<&str> = triggers.iter().map(|node| node.id.as_str()).collect();

    let mut connected: HashSet<&str> = HashSet::new();
    for edge in edges {
        connected.insert(edge.source.as_str());
        connected.insert(edge.target.as_str());
    }

    for node in nodes {
        if !trigger_ids.contains(node.id.as_str()) && !connected.contains(node.id.as_str()) {
            errors.push(GraphError::OrphanNode(node.id.clone()));
        }
    }

    for edge in edges {
        for endpoint in [&edge.source, &edge.target] {
            if !known.contains(endpoint.as_str()) {
                errors.push(GraphError::DanglingEdge {
                    from: edge.source.clone(),
                    to: edge.target.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
    }

    GraphValidation {
        valid: errors.is_empty(),
        errors,
    }
}
