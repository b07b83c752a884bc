//! The llm-generate executor: one provider call, parsed into the declared
//! outputs.
//!
//! The system prompt is rendered with `{name}` substitution, the projected
//! input view becomes the first user message, and the model's reply is
//! parsed per the node's declared output shape: a JSON object supplying the
//! output keys, or — for single-output nodes — plain text stored under that
//! key.

use serde_json::Value;

use crate::graph::NodeSpec;
use crate::llm::{ChatMessage, CompletionRequest, LlmClient};
use crate::memory::{InputView, NodeOutput};

use super::{ExecutorLimits, NodeError, NodeOutcome, NodeSuccess};

pub(super) async fn execute(
    llm: &dyn LlmClient,
    node: &NodeSpec,
    view: &InputView,
    limits: &ExecutorLimits,
) -> NodeOutcome {
    let system = match super::rendered_system_prompt(node, view) {
        Ok(system) => system,
        Err(error) => return NodeOutcome::Failure(error),
    };

    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(super::view_as_user_message(node, view)));

    let request = CompletionRequest {
        messages,
        tools: Vec::new(),
    };
    let response = match tokio::time::timeout(limits.llm_turn_timeout, llm.complete(request)).await
    {
        Err(_) => return NodeOutcome::Failure(NodeError::Timeout { scope: "llm-turn" }),
        Ok(Err(error)) => return NodeOutcome::Failure(error.into()),
        Ok(Ok(response)) => response,
    };

    match parse_outputs(&response.message.content, node) {
        Ok(output) => NodeOutcome::Success(NodeSuccess {
            output,
            tokens: response.usage,
        }),
        Err(error) => NodeOutcome::Failure(error),
    }
}

/// Parse a model reply per the node's declared output shape.
pub(crate) fn parse_outputs(text: &str, node: &NodeSpec) -> Result<NodeOutput, NodeError> {
    let body = strip_code_fence(text);

    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(body) {
        let mut output = NodeOutput::default();
        for (key, value) in object {
            if node.output_keys.iter().any(|k| *k == key) {
                output.set(key, value);
            } else {
                tracing::debug!(node = %node.id, %key, "ignoring undeclared key in llm output");
            }
        }
        return Ok(output);
    }

    // Not a JSON object: acceptable only for a single-output node.
    if node.output_keys.len() == 1 {
        let mut output = NodeOutput::default();
        output.set(
            node.output_keys[0].clone(),
            Value::String(body.trim().to_string()),
        );
        return Ok(output);
    }

    Err(NodeError::MalformedOutput {
        reason: format!(
            "expected a JSON object with keys {:?}, got free text",
            node.output_keys
        ),
    })
}

/// Strip a surrounding Markdown code fence, if any.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    rest.strip_suffix("```").map_or(rest, str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeType;
    use serde_json::json;

    fn node(outputs: &[&str]) -> NodeSpec {
        NodeSpec {
            id: "gen".to_string(),
            name: "gen".to_string(),
            node_type: NodeType::LlmGenerate,
            input_keys: vec![],
            output_keys: outputs.iter().map(|s| (*s).to_string()).collect(),
            nullable_keys: vec![],
            tools: vec![],
            system_prompt: None,
            client_facing: false,
            max_visits: 1,
            routes: vec![],
            route_default: None,
        }
    }

    #[test]
    fn json_object_fills_declared_keys() {
        let out = parse_outputs(r#"{"summary": "s", "score": 2, "extra": true}"#, &node(&["summary", "score"])).unwrap();
        assert_eq!(out.get("summary"), Some(&json!("s")));
        assert_eq!(out.get("score"), Some(&json!(2)));
        assert_eq!(out.get("extra"), None);
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let out = parse_outputs("```json\n{\"summary\": \"s\"}\n```", &node(&["summary"])).unwrap();
        assert_eq!(out.get("summary"), Some(&json!("s")));
    }

    #[test]
    fn free_text_fills_a_single_output() {
        let out = parse_outputs("just words", &node(&["answer"])).unwrap();
        assert_eq!(out.get("answer"), Some(&json!("just words")));
    }

    #[test]
    fn free_text_with_many_outputs_is_malformed() {
        let err = parse_outputs("just words", &node(&["a", "b"])).unwrap_err();
        assert!(matches!(err, NodeError::MalformedOutput { .. }));
    }
}
