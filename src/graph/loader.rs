//! Loading, dumping, and validating persisted graph descriptions.
//!
//! The persisted form is a JSON document: header, goal block, nodes array,
//! edges array, and a graph-config block with entry points and the pause and
//! terminal sets. `load(dump(g))` reproduces `g` for every valid graph.
//!
//! Validation is fatal and runs once, at load (or [`Graph::new`]); the
//! scheduler relies on every invariant checked here.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::Path;
use thiserror::Error;

use crate::predicate::{Predicate, PredicateError};

use super::{Edge, EdgeCondition, Graph, NodeType};

/// A structural defect in a graph description. Fatal at load.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("failed to read graph document: {0}")]
    #[diagnostic(code(hivegraph::graph::io))]
    Io(#[from] std::io::Error),

    #[error("graph document is not valid JSON: {0}")]
    #[diagnostic(code(hivegraph::graph::parse))]
    Parse(#[from] serde_json::Error),

    #[error("duplicate node id `{id}`")]
    #[diagnostic(code(hivegraph::graph::duplicate_node))]
    DuplicateNode { id: String },

    #[error("duplicate edge id `{id}`")]
    #[diagnostic(code(hivegraph::graph::duplicate_edge))]
    DuplicateEdge { id: String },

    #[error("edge `{edge}` references undefined node `{node}`")]
    #[diagnostic(
        code(hivegraph::graph::dangling_edge),
        help("every edge endpoint must name a node in the nodes array")
    )]
    DanglingEdge { edge: String, node: String },

    #[error("graph declares no entry points")]
    #[diagnostic(
        code(hivegraph::graph::no_entry),
        help("add at least one entry point, conventionally named `start`")
    )]
    NoEntryPoints,

    #[error("entry point `{name}` maps to undefined node `{node}`")]
    #[diagnostic(code(hivegraph::graph::dangling_entry))]
    DanglingEntryPoint { name: String, node: String },

    #[error("{set} set references undefined node `{node}`")]
    #[diagnostic(code(hivegraph::graph::dangling_config))]
    DanglingConfigNode { set: &'static str, node: String },

    #[error("node `{node}` is declared both pause and terminal")]
    #[diagnostic(
        code(hivegraph::graph::pause_terminal_overlap),
        help("a run cannot both suspend and complete at the same node")
    )]
    PauseTerminalOverlap { node: String },

    #[error("edge `{edge}` has priority 0")]
    #[diagnostic(
        code(hivegraph::graph::zero_priority),
        help("the sign of the priority distinguishes forward from feedback edges")
    )]
    ZeroPriority { edge: String },

    #[error("conditional edge `{edge}` is missing a predicate")]
    #[diagnostic(code(hivegraph::graph::missing_predicate))]
    MissingPredicate { edge: String },

    #[error("edge `{edge}` carries a predicate but is not conditional")]
    #[diagnostic(code(hivegraph::graph::unexpected_predicate))]
    UnexpectedPredicate { edge: String },

    #[error("predicate of {owner} does not parse: {source}")]
    #[diagnostic(code(hivegraph::graph::bad_predicate))]
    BadPredicate {
        owner: String,
        #[source]
        source: PredicateError,
    },

    #[error("predicate of {owner} references unknown key `{key}`")]
    #[diagnostic(
        code(hivegraph::graph::unknown_predicate_key),
        help("predicates may only reference keys some node produces or the input payload supplies")
    )]
    UnknownPredicateKey { owner: String, key: String },

    #[error("node `{node}` consumes `{key}`, which no reachable predecessor produces")]
    #[diagnostic(
        code(hivegraph::graph::consumed_before_produced),
        help(
            "declare the key nullable on `{node}`, supply it in the input payload, \
             or route a producer before this node"
        )
    )]
    ConsumedBeforeProduced { node: String, key: String },

    #[error("entry node `{node}` has an incoming forward edge `{edge}`")]
    #[diagnostic(
        code(hivegraph::graph::entry_with_forward_in),
        help("entry nodes may only be re-entered through feedback edges (negative priority)")
    )]
    EntryWithForwardIn { node: String, edge: String },

    #[error("node `{node}` has ambiguous forward fan-out at priority {priority}")]
    #[diagnostic(
        code(hivegraph::graph::ambiguous_fan_out),
        help("two forward edges whose conditions can fire on the same outcome must differ in priority")
    )]
    AmbiguousFanOut { node: String, priority: i32 },

    #[error("router node `{node}` must declare exactly one output key")]
    #[diagnostic(code(hivegraph::graph::router_outputs))]
    RouterOutputs { node: String },

    #[error("router node `{node}` has neither routes nor a default")]
    #[diagnostic(code(hivegraph::graph::router_empty))]
    RouterEmpty { node: String },

    #[error("client-facing node `{node}` must be an llm-tools pause node")]
    #[diagnostic(
        code(hivegraph::graph::client_facing),
        help("only the llm-tools event loop can suspend between turns, and suspension requires \
              the node to be in the pause set")
    )]
    ClientFacingMisuse { node: String },

    #[error("success criterion `{id}` has non-positive weight {weight}")]
    #[diagnostic(code(hivegraph::graph::criterion_weight))]
    CriterionWeight { id: String, weight: f64 },

    #[error("duplicate success criterion id `{id}`")]
    #[diagnostic(code(hivegraph::graph::duplicate_criterion))]
    DuplicateCriterion { id: String },
}

/// Parse and validate a graph document from disk.
pub fn load(path: impl AsRef<Path>) -> Result<Graph, GraphError> {
    let text = std::fs::read_to_string(path)?;
    load_str(&text)
}

/// Parse and validate a graph document from a string.
pub fn load_str(text: &str) -> Result<Graph, GraphError> {
    let graph: Graph = serde_json::from_str(text)?;
    validate(&graph)?;
    Ok(graph)
}

/// Serialize a graph to its persisted document form.
///
/// Round-trips: `load_str(&dump(&g))` yields a graph equal to `g`.
#[must_use]
pub fn dump(graph: &Graph) -> String {
    // Graph serialization cannot fail: every value is a plain data type.
    serde_json::to_string_pretty(graph).unwrap_or_default()
}

/// Run the full validation suite against an assembled graph.
pub fn validate(graph: &Graph) -> Result<(), GraphError> {
    check_identities(graph)?;
    check_config(graph)?;
    check_edges(graph)?;
    check_goal(graph)?;
    check_nodes(graph)?;
    check_predicates(graph)?;
    check_inputs(graph)?;
    Ok(())
}

fn check_identities(graph: &Graph) -> Result<(), GraphError> {
    let mut node_ids = FxHashSet::default();
    for node in graph.nodes() {
        if !node_ids.insert(node.id.as_str()) {
            return Err(GraphError::DuplicateNode {
                id: node.id.clone(),
            });
        }
    }
    let mut edge_ids = FxHashSet::default();
    for edge in graph.edges() {
        if !edge_ids.insert(edge.id.as_str()) {
            return Err(GraphError::DuplicateEdge {
                id: edge.id.clone(),
            });
        }
    }
    Ok(())
}

fn check_config(graph: &Graph) -> Result<(), GraphError> {
    if graph.entry_points().is_empty() {
        return Err(GraphError::NoEntryPoints);
    }
    for (name, node) in graph.entry_points() {
        if graph.node(node).is_none() {
            return Err(GraphError::DanglingEntryPoint {
                name: name.clone(),
                node: node.clone(),
            });
        }
    }
    for node in graph.pause_nodes() {
        if graph.node(node).is_none() {
            return Err(GraphError::DanglingConfigNode {
                set: "pause",
                node: node.clone(),
            });
        }
        if graph.is_terminal(node) {
            return Err(GraphError::PauseTerminalOverlap { node: node.clone() });
        }
    }
    for node in graph.terminal_nodes() {
        if graph.node(node).is_none() {
            return Err(GraphError::DanglingConfigNode {
                set: "terminal",
                node: node.clone(),
            });
        }
    }
    // Entry nodes accept feedback but never forward edges from another
    // node. Resume entry points (`<pause-node>_resume`) are exempt: they
    // re-enter the graph mid-flow by design.
    for (name, entry) in graph.entry_points() {
        let is_resume_entry = graph
            .pause_nodes()
            .iter()
            .any(|pause| *name == format!("{pause}_resume"));
        if is_resume_entry {
            continue;
        }
        for edge in graph.edges() {
            if edge.to == *entry && edge.is_forward() && edge.from != *entry {
                return Err(GraphError::EntryWithForwardIn {
                    node: entry.clone(),
                    edge: edge.id.clone(),
                });
            }
        }
    }
    Ok(())
}

fn check_edges(graph: &Graph) -> Result<(), GraphError> {
    for edge in graph.edges() {
        for endpoint in [&edge.from, &edge.to] {
            if graph.node(endpoint).is_none() {
                return Err(GraphError::DanglingEdge {
                    edge: edge.id.clone(),
                    node: endpoint.clone(),
                });
            }
        }
        if edge.priority == 0 {
            return Err(GraphError::ZeroPriority {
                edge: edge.id.clone(),
            });
        }
        match edge.condition {
            EdgeCondition::Conditional => {
                if edge.predicate.as_deref().is_none_or(str::is_empty) {
                    return Err(GraphError::MissingPredicate {
                        edge: edge.id.clone(),
                    });
                }
            }
            _ => {
                if edge.predicate.is_some() {
                    return Err(GraphError::UnexpectedPredicate {
                        edge: edge.id.clone(),
                    });
                }
            }
        }
    }

    // Forward fan-out: two forward edges from one source at the same priority
    // are ambiguous when their conditions can fire on the same outcome.
    for node in graph.nodes() {
        let forward: Vec<&Edge> = graph
            .edges()
            .filter(|e| e.from == node.id && e.is_forward())
            .collect();
        for (i, a) in forward.iter().enumerate() {
            for b in &forward[i + 1..] {
                if a.priority == b.priority && conditions_overlap(a.condition, b.condition) {
                    return Err(GraphError::AmbiguousFanOut {
                        node: node.id.clone(),
                        priority: a.priority,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Whether two edge conditions can both fire on one observed outcome.
///
/// Conditional pairs are tolerated: predicates are evaluated at runtime and
/// ties resolve deterministically by edge id.
fn conditions_overlap(a: EdgeCondition, b: EdgeCondition) -> bool {
    use EdgeCondition::*;
    match (a, b) {
        (OnSuccess, OnFailure) | (OnFailure, OnSuccess) => false,
        (Conditional, Conditional) => false,
        (Always, _) | (_, Always) => true,
        (OnSuccess, OnSuccess) | (OnFailure, OnFailure) => true,
        (Conditional, OnSuccess) | (OnSuccess, Conditional) => true,
        (Conditional, OnFailure) | (OnFailure, Conditional) => false,
    }
}

fn check_goal(graph: &Graph) -> Result<(), GraphError> {
    let mut ids = FxHashSet::default();
    for criterion in &graph.goal.success_criteria {
        if !ids.insert(criterion.id.as_str()) {
            return Err(GraphError::DuplicateCriterion {
                id: criterion.id.clone(),
            });
        }
        if criterion.weight <= 0.0 {
            return Err(GraphError::CriterionWeight {
                id: criterion.id.clone(),
                weight: criterion.weight,
            });
        }
    }
    Ok(())
}

fn check_nodes(graph: &Graph) -> Result<(), GraphError> {
    for node in graph.nodes() {
        if node.node_type == NodeType::Router {
            if node.output_keys.len() != 1 {
                return Err(GraphError::RouterOutputs {
                    node: node.id.clone(),
                });
            }
            if node.routes.is_empty() && node.route_default.is_none() {
                return Err(GraphError::RouterEmpty {
                    node: node.id.clone(),
                });
            }
        }
        if node.client_facing
            && (node.node_type != NodeType::LlmTools || !graph.is_pause(&node.id))
        {
            return Err(GraphError::ClientFacingMisuse {
                node: node.id.clone(),
            });
        }
    }
    Ok(())
}

fn check_predicates(graph: &Graph) -> Result<(), GraphError> {
    let known: FxHashSet<&str> = graph
        .produced_keys()
        .into_iter()
        .chain(graph.payload_keys())
        .collect();

    let mut check = |owner: String, source: &str| -> Result<(), GraphError> {
        let predicate = Predicate::parse(source).map_err(|e| GraphError::BadPredicate {
            owner: owner.clone(),
            source: e,
        })?;
        for key in predicate.references() {
            if !known.contains(key.as_str()) {
                return Err(GraphError::UnknownPredicateKey {
                    owner,
                    key: key.clone(),
                });
            }
        }
        Ok(())
    };

    for edge in graph.edges() {
        if let Some(source) = &edge.predicate {
            check(format!("edge `{}`", edge.id), source)?;
        }
    }
    for node in graph.nodes() {
        for (i, rule) in node.routes.iter().enumerate() {
            check(format!("route {i} of node `{}`", node.id), &rule.when)?;
        }
    }
    Ok(())
}

/// Every required input of every node must be producible before the node can
/// run: by a predecessor (over any edge, feedback included), or by the input
/// payload (keys no node produces). A key produced only by non-predecessors
/// is a wiring error.
fn check_inputs(graph: &Graph) -> Result<(), GraphError> {
    let producers: FxHashMap<&str, Vec<&str>> = {
        let mut map: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
        for node in graph.nodes() {
            for key in &node.output_keys {
                map.entry(key.as_str()).or_default().push(node.id.as_str());
            }
        }
        map
    };

    for node in graph.nodes() {
        let ancestors = ancestors_of(graph, &node.id);
        for key in node.required_inputs() {
            match producers.get(key) {
                // Produced nowhere: must come from the initial payload.
                None => {}
                Some(srcs) => {
                    let reachable = srcs.iter().any(|s| ancestors.contains(s));
                    if !reachable {
                        return Err(GraphError::ConsumedBeforeProduced {
                            node: node.id.clone(),
                            key: key.to_string(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

/// Node ids with a path to `target` over the full edge set.
fn ancestors_of<'g>(graph: &'g Graph, target: &str) -> FxHashSet<&'g str> {
    let mut reverse: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
    for edge in graph.edges() {
        reverse
            .entry(edge.to.as_str())
            .or_default()
            .push(edge.from.as_str());
    }
    let mut seen = FxHashSet::default();
    let mut stack: Vec<&str> = reverse.get(target).cloned().unwrap_or_default();
    while let Some(id) = stack.pop() {
        if seen.insert(id) {
            if let Some(parents) = reverse.get(id) {
                stack.extend(parents.iter().copied());
            }
        }
    }
    seen
}
