//! Graph descriptions: the immutable shape of a goal-driven workflow.
//!
//! A [`Graph`] is a static description of nodes, edges, named entry points,
//! and the pause/terminal node sets, headed by the goal it serves. Graphs are
//! produced by the loader (see [`loader`]) or assembled in code, validated
//! once, and never mutated by execution; all run state lives in the memory
//! plane.
//!
//! # Key Types
//!
//! - [`Graph`]: the validated description handed to the scheduler
//! - [`NodeSpec`]: one unit of work and its memory contract
//! - [`Edge`]: a routing rule with condition and signed priority
//! - [`GoalSpec`]: the goal block (success criteria, constraints)

pub mod loader;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use loader::{GraphError, dump, load, load_str};

/// Entry point name used when the caller does not pick one.
pub const DEFAULT_ENTRY: &str = "start";

/// Conventional memory key that receives the reply on resume.
pub const RESUME_INPUT_KEY: &str = "input";

/// The executor variant a node dispatches to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    /// Host-provided deterministic transformation.
    Function,
    /// Single LLM call, response parsed into the declared outputs.
    LlmGenerate,
    /// Multi-turn LLM event loop with tool access.
    LlmTools,
    /// Declarative predicate producing a routing key. No LLM, no tools.
    Router,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Function => write!(f, "function"),
            NodeType::LlmGenerate => write!(f, "llm-generate"),
            NodeType::LlmTools => write!(f, "llm-tools"),
            NodeType::Router => write!(f, "router"),
        }
    }
}

/// One rule of a router node: when `when` holds, route to `value`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Predicate source in the bounded expression sublanguage.
    pub when: String,
    /// Routing key written to the node's output when the predicate holds.
    pub value: String,
}

/// Declared shape of a single node.
///
/// Nodes own no state. Their contract with the memory plane is declarative:
/// `input_keys` are read at schedule time, `output_keys` must be present
/// after a successful commit, and keys listed in `nullable_keys` are excused
/// on either side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique id within the graph.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Keys consumed from the memory plane.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Keys produced into the memory plane.
    #[serde(default)]
    pub output_keys: Vec<String>,
    /// Keys permitted to be absent: as inputs at schedule time, as outputs at
    /// commit time.
    #[serde(default)]
    pub nullable_keys: Vec<String>,
    /// Tool names this node may call (llm-tools only).
    #[serde(default)]
    pub tools: Vec<String>,
    /// System prompt template, rendered with `{name}` substitution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// The node streams to the human and blocks for input between turns.
    #[serde(default)]
    pub client_facing: bool,
    /// Per-run execution cap. 0 means unlimited.
    #[serde(default = "default_max_visits")]
    pub max_visits: u32,
    /// Ordered routing rules (router only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteRule>,
    /// Fallback routing key when no rule matches (router only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_default: Option<String>,
}

fn default_max_visits() -> u32 {
    1
}

impl NodeSpec {
    /// Whether `key` may be absent under this node's contract.
    #[must_use]
    pub fn is_nullable(&self, key: &str) -> bool {
        self.nullable_keys.iter().any(|k| k == key)
    }

    /// Input keys that must be present before this node is scheduled.
    pub fn required_inputs(&self) -> impl Iterator<Item = &str> {
        self.input_keys
            .iter()
            .map(String::as_str)
            .filter(|k| !self.is_nullable(k))
    }

    /// Output keys that must be present after a successful commit.
    pub fn required_outputs(&self) -> impl Iterator<Item = &str> {
        self.output_keys
            .iter()
            .map(String::as_str)
            .filter(|k| !self.is_nullable(k))
    }
}

/// When an edge fires, relative to the just-observed node outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeCondition {
    /// Fires after a successful commit.
    OnSuccess,
    /// Fires after a node failure (including a visit-cap dead end).
    OnFailure,
    /// Fires on either outcome.
    Always,
    /// Fires after a successful commit when the predicate holds against the
    /// post-merge memory plane.
    Conditional,
}

impl fmt::Display for EdgeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeCondition::OnSuccess => write!(f, "on-success"),
            EdgeCondition::OnFailure => write!(f, "on-failure"),
            EdgeCondition::Always => write!(f, "always"),
            EdgeCondition::Conditional => write!(f, "conditional"),
        }
    }
}

/// A directed routing rule between two nodes.
///
/// Positive priority marks a forward edge (evaluated first, in decreasing
/// order); negative priority marks a feedback edge looping back to an earlier
/// node. Ties are broken by edge id, lexicographically, for determinism.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub from: String,
    pub to: String,
    pub condition: EdgeCondition,
    /// Predicate source; present exactly when `condition` is `conditional`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    pub priority: i32,
}

impl Edge {
    /// Forward edges carry positive priority.
    #[must_use]
    pub fn is_forward(&self) -> bool {
        self.priority > 0
    }
}

/// Weight attached to one measurable success criterion of the goal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub id: String,
    pub description: String,
    pub metric: String,
    pub target: String,
    pub weight: f64,
}

/// Hard constraints must hold; soft constraints are preferences.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintKind {
    Hard,
    Soft,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: String,
    pub description: String,
    pub kind: ConstraintKind,
    pub category: String,
}

/// The goal block heading a persisted graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GoalSpec {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

/// Document identity and format version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphHeader {
    pub id: String,
    pub version: u32,
}

/// Entry points and the pause/terminal node sets.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Symbolic name → node id. Must contain at least one entry.
    pub entry_points: FxHashMap<String, String>,
    #[serde(default)]
    pub pause_nodes: FxHashSet<String>,
    #[serde(default)]
    pub terminal_nodes: FxHashSet<String>,
}

/// A validated, immutable graph description.
///
/// Construction goes through [`Graph::new`] (or the loader), which runs the
/// full set of structural checks; a `Graph` in hand is always well-formed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub header: GraphHeader,
    pub goal: GoalSpec,
    nodes: Vec<NodeSpec>,
    edges: Vec<Edge>,
    config: GraphConfig,
}

impl Graph {
    /// Assemble and validate a graph from its parts.
    pub fn new(
        header: GraphHeader,
        goal: GoalSpec,
        nodes: Vec<NodeSpec>,
        edges: Vec<Edge>,
        config: GraphConfig,
    ) -> Result<Self, GraphError> {
        let graph = Self {
            header,
            goal,
            nodes,
            edges,
            config,
        };
        loader::validate(&graph)?;
        Ok(graph)
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    /// Outgoing edges of `id` in evaluation order: priority descending, ties
    /// broken by edge id.
    #[must_use]
    pub fn edges_from(&self, id: &str) -> Vec<&Edge> {
        let mut out: Vec<&Edge> = self.edges.iter().filter(|e| e.from == id).collect();
        out.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        out
    }

    /// Resolve a symbolic entry point to a node id.
    #[must_use]
    pub fn entry_point(&self, name: &str) -> Option<&str> {
        self.config.entry_points.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn entry_points(&self) -> &FxHashMap<String, String> {
        &self.config.entry_points
    }

    #[must_use]
    pub fn is_pause(&self, id: &str) -> bool {
        self.config.pause_nodes.contains(id)
    }

    #[must_use]
    pub fn is_terminal(&self, id: &str) -> bool {
        self.config.terminal_nodes.contains(id)
    }

    #[must_use]
    pub fn pause_nodes(&self) -> &FxHashSet<String> {
        &self.config.pause_nodes
    }

    #[must_use]
    pub fn terminal_nodes(&self) -> &FxHashSet<String> {
        &self.config.terminal_nodes
    }

    /// Keys produced by any node in the graph.
    #[must_use]
    pub fn produced_keys(&self) -> FxHashSet<&str> {
        self.nodes
            .iter()
            .flat_map(|n| n.output_keys.iter().map(String::as_str))
            .collect()
    }

    /// Keys some node consumes but no node produces: they can only come from
    /// the initial input payload.
    #[must_use]
    pub fn payload_keys(&self) -> FxHashSet<&str> {
        let produced = self.produced_keys();
        self.nodes
            .iter()
            .flat_map(|n| n.input_keys.iter().map(String::as_str))
            .filter(|k| !produced.contains(k))
            .collect()
    }
}
