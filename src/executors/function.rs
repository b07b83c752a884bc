//! The function executor: host-provided deterministic transformations.
//!
//! Bindings are keyed by node id. A binding receives the node's input view
//! and returns the mapping it produced; the executor verifies every returned
//! key was declared, then hands the buffer to the scheduler for the atomic
//! commit.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::graph::NodeSpec;
use crate::memory::{InputView, NodeOutput};

use super::{NodeError, NodeOutcome, NodeSuccess};

/// Failure raised by a host binding.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct FunctionError {
    pub message: String,
}

impl FunctionError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A host-provided transformation bound to one node id.
///
/// Bindings should be pure: no external I/O unless the host deliberately
/// performs it.
#[async_trait]
pub trait NodeFunction: Send + Sync {
    async fn call(&self, view: &InputView) -> Result<FxHashMap<String, Value>, FunctionError>;
}

/// Adapter so plain closures can serve as bindings.
struct FnBinding<F>(F);

#[async_trait]
impl<F> NodeFunction for FnBinding<F>
where
    F: Fn(&InputView) -> Result<FxHashMap<String, Value>, FunctionError> + Send + Sync,
{
    async fn call(&self, view: &InputView) -> Result<FxHashMap<String, Value>, FunctionError> {
        (self.0)(view)
    }
}

/// Registry of host bindings, keyed by node id.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    bindings: FxHashMap<String, Arc<dyn NodeFunction>>,
}

impl FunctionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node_id: impl Into<String>, binding: Arc<dyn NodeFunction>) {
        self.bindings.insert(node_id.into(), binding);
    }

    /// Bind a synchronous closure.
    pub fn register_fn<F>(&mut self, node_id: impl Into<String>, f: F)
    where
        F: Fn(&InputView) -> Result<FxHashMap<String, Value>, FunctionError>
            + Send
            + Sync
            + 'static,
    {
        self.register(node_id, Arc::new(FnBinding(f)));
    }

    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<&Arc<dyn NodeFunction>> {
        self.bindings.get(node_id)
    }
}

pub(super) async fn execute(
    registry: &FunctionRegistry,
    node: &NodeSpec,
    view: &InputView,
) -> NodeOutcome {
    let Some(binding) = registry.get(&node.id) else {
        return NodeOutcome::Failure(NodeError::Unbound {
            node: node.id.clone(),
        });
    };

    match binding.call(view).await {
        Ok(produced) => {
            for key in produced.keys() {
                if !node.output_keys.iter().any(|k| k == key) {
                    return NodeOutcome::Failure(NodeError::Function {
                        node: node.id.clone(),
                        message: format!("binding produced undeclared key `{key}`"),
                    });
                }
            }
            NodeOutcome::Success(NodeSuccess {
                output: NodeOutput::from_map(produced),
                tokens: Default::default(),
            })
        }
        Err(error) => NodeOutcome::Failure(NodeError::Function {
            node: node.id.clone(),
            message: error.message,
        }),
    }
}
