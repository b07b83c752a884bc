//! The router executor: a declarative predicate table, no LLM, no tools.
//!
//! Rules are evaluated in declaration order against the input view; the
//! first match writes its routing key to the node's single output. The
//! scheduler then steers through `conditional` edges over that key.

use serde_json::Value;

use crate::graph::NodeSpec;
use crate::memory::{InputView, NodeOutput};
use crate::predicate::Predicate;

use super::{NodeError, NodeOutcome, NodeSuccess};

pub(super) fn execute(node: &NodeSpec, view: &InputView) -> NodeOutcome {
    let route = match pick_route(node, view) {
        Ok(Some(route)) => route,
        Ok(None) => {
            return NodeOutcome::Failure(NodeError::NoRoute {
                node: node.id.clone(),
            });
        }
        Err(error) => return NodeOutcome::Failure(error),
    };

    // Validation guarantees exactly one output key on router nodes.
    let mut output = NodeOutput::default();
    output.set(node.output_keys[0].clone(), Value::String(route));
    NodeOutcome::Success(NodeSuccess {
        output,
        tokens: Default::default(),
    })
}

fn pick_route(node: &NodeSpec, view: &InputView) -> Result<Option<String>, NodeError> {
    for rule in &node.routes {
        let predicate = Predicate::parse(&rule.when)?;
        if predicate.eval(view.values())? {
            return Ok(Some(rule.value.clone()));
        }
    }
    Ok(node.route_default.clone())
}
