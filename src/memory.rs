//! The per-run memory plane: a keyed store with per-node contracts.
//!
//! Each run owns exactly one [`MemoryPlane`]. Nodes never touch it directly:
//! they read an [`InputView`] snapshotted at schedule time and return a
//! [`NodeOutput`] of buffered writes. The scheduler applies the buffer
//! atomically at commit, so a failed node leaves no trace.
//!
//! # Examples
//!
//! ```
//! use hivegraph::memory::{MemoryPlane, NodeOutput};
//! use serde_json::json;
//!
//! let mut plane = MemoryPlane::default();
//! plane.write("topic", json!("rust"));
//!
//! let view = plane.view();
//! assert_eq!(view.get("topic"), Some(&json!("rust")));
//!
//! let mut out = NodeOutput::default();
//! out.set("summary", json!("done"));
//! plane.apply(out);
//! assert_eq!(plane.read("summary"), Some(&json!("done")));
//! ```

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::graph::NodeSpec;

/// A memory-plane contract violation, surfaced as a node failure.
#[derive(Debug, Error, Diagnostic)]
pub enum MemoryError {
    /// A non-nullable declared output key was absent at commit.
    #[error("node `{node}` completed without required output `{key}`")]
    #[diagnostic(
        code(hivegraph::memory::missing_required_output),
        help("produce the key, or list it under the node's nullable keys")
    )]
    MissingRequiredOutput { node: String, key: String },
}

/// The run's keyed store.
///
/// Keys are written by exactly one node per run, except when a feedback loop
/// revisits a producer, in which case writes overwrite prior values
/// (last-write-wins).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemoryPlane {
    values: FxHashMap<String, Value>,
}

impl MemoryPlane {
    /// Seed a plane from the initial input payload.
    #[must_use]
    pub fn from_payload(payload: FxHashMap<String, Value>) -> Self {
        Self { values: payload }
    }

    /// Unconditional overwrite.
    pub fn write(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    #[must_use]
    pub fn read(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Immutable snapshot used to feed a node's input view.
    #[must_use]
    pub fn view(&self) -> InputView {
        InputView {
            values: self.values.clone(),
        }
    }

    /// Raw access for predicate evaluation against the post-merge plane.
    #[must_use]
    pub fn values(&self) -> &FxHashMap<String, Value> {
        &self.values
    }

    /// Apply a node's buffered writes unconditionally.
    pub fn apply(&mut self, output: NodeOutput) {
        for (k, v) in output.writes {
            self.values.insert(k, v);
        }
    }

    /// Apply a node's buffered writes, enforcing the node's output contract:
    /// every non-nullable declared output key must be present either in the
    /// buffer or (from an earlier visit) in the plane.
    pub fn merge(&mut self, node: &NodeSpec, output: NodeOutput) -> Result<(), MemoryError> {
        for key in node.required_outputs() {
            if !output.writes.contains_key(key) && !self.values.contains_key(key) {
                return Err(MemoryError::MissingRequiredOutput {
                    node: node.id.clone(),
                    key: key.to_string(),
                });
            }
        }
        self.apply(output);
        Ok(())
    }

    /// Owned export for snapshots and status reporting.
    #[must_use]
    pub fn export(&self) -> FxHashMap<String, Value> {
        self.values.clone()
    }
}

/// Read-only view of the memory plane at the moment a node was scheduled.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InputView {
    values: FxHashMap<String, Value>,
}

impl InputView {
    #[must_use]
    pub fn from_values(values: FxHashMap<String, Value>) -> Self {
        Self { values }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    #[must_use]
    pub fn values(&self) -> &FxHashMap<String, Value> {
        &self.values
    }

    /// Restrict the view to a node's declared input keys, the slice the
    /// executors serialize for the LLM.
    #[must_use]
    pub fn project(&self, keys: &[String]) -> FxHashMap<String, Value> {
        keys.iter()
            .filter_map(|k| self.values.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }
}

/// Writes buffered during one node execution, applied atomically at commit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeOutput {
    writes: FxHashMap<String, Value>,
}

impl NodeOutput {
    #[must_use]
    pub fn from_map(writes: FxHashMap<String, Value>) -> Self {
        Self { writes }
    }

    /// Buffer a write. Later writes to the same key win.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.writes.insert(key.into(), value);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.writes.get(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    #[must_use]
    pub fn as_map(&self) -> &FxHashMap<String, Value> {
        &self.writes
    }

    #[must_use]
    pub fn into_map(self) -> FxHashMap<String, Value> {
        self.writes
    }
}

/// The per-run visit ledger: node id → completed executions.
///
/// Reset at run start; incremented once per successful execution. A node
/// whose count has reached its cap is ineligible for further scheduling.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VisitCounter {
    counts: FxHashMap<String, u32>,
}

impl VisitCounter {
    #[must_use]
    pub fn from_counts(counts: FxHashMap<String, u32>) -> Self {
        Self { counts }
    }

    #[must_use]
    pub fn count(&self, node: &str) -> u32 {
        self.counts.get(node).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, node: &str) {
        *self.counts.entry(node.to_string()).or_insert(0) += 1;
    }

    /// Whether the node may still be scheduled under its cap (0 = unlimited).
    #[must_use]
    pub fn allows(&self, node: &NodeSpec) -> bool {
        node.max_visits == 0 || self.count(&node.id) < node.max_visits
    }

    #[must_use]
    pub fn export(&self) -> FxHashMap<String, u32> {
        self.counts.clone()
    }
}
