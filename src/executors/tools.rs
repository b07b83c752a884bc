//! The llm-tools executor: the multi-turn LLM-and-tools event loop.
//!
//! One invocation drives a conversation: call the model with the transcript
//! and the node's permitted tool schemas, dispatch any requested tool calls
//! through the broker, append results, and repeat. Outputs are not parsed
//! from prose — the model commits them explicitly through the `set_output`
//! pseudo-tool, and a plain-text turn with no calls ends the loop.
//!
//! For a client-facing node the plain-text turn instead suspends the node,
//! carrying the text to the human; on resume the reply is appended as a user
//! message and the loop continues. Suspension therefore lands strictly
//! between LLM turns.

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::broker::{BrokerError, ToolBroker, ToolReply};
use crate::errors::ErrorKind;
use crate::graph::NodeSpec;
use crate::llm::{ChatMessage, CompletionRequest, LlmClient, TokenUsage, ToolCallRequest, ToolSchema};
use crate::memory::{InputView, NodeOutput};
use crate::recorder::{Recorder, Severity};

use super::{ExecutorLimits, NodeError, NodeOutcome, NodeSuccess, ResumeState, Suspension};

/// Name of the pseudo-tool the model uses to commit an output value.
pub const SET_OUTPUT_TOOL: &str = "set_output";

/// Schema advertised for the `set_output` pseudo-tool.
#[must_use]
pub fn set_output_schema() -> ToolSchema {
    ToolSchema {
        name: SET_OUTPUT_TOOL.to_string(),
        description: "Commit one output value of this step. Call once per output key. \
                      Do not combine with other tool calls in the same turn."
            .to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Output key to set" },
                "value": { "description": "Value to store under the key" }
            },
            "required": ["name", "value"]
        }),
    }
}

#[allow(clippy::too_many_arguments)]
pub(super) async fn execute(
    llm: &dyn LlmClient,
    broker: &ToolBroker,
    node: &NodeSpec,
    view: &InputView,
    resume: Option<ResumeState>,
    limits: &ExecutorLimits,
    recorder: &Recorder,
) -> NodeOutcome {
    let continuing = resume.is_some();
    let (mut transcript, mut buffered) = match resume {
        Some(state) => {
            let mut transcript = state.transcript;
            transcript.push(ChatMessage::user(state.reply));
            (transcript, state.buffered)
        }
        None => {
            let system = match super::rendered_system_prompt(node, view) {
                Ok(system) => system,
                Err(error) => return NodeOutcome::Failure(error),
            };
            let mut transcript = Vec::new();
            if let Some(system) = system {
                transcript.push(ChatMessage::system(system));
            }
            transcript.push(ChatMessage::user(super::view_as_user_message(node, view)));
            (transcript, FxHashMap::default())
        }
    };

    let mut schemas = broker.schemas_for(&node.tools).await;
    schemas.push(set_output_schema());

    let mut turns: u32 = 0;
    let mut tokens = TokenUsage::default();

    loop {
        if turns >= limits.max_loop_turns || tokens.total() >= limits.max_loop_tokens {
            return NodeOutcome::Failure(NodeError::LoopExhausted {
                turns,
                tokens: tokens.total(),
            });
        }

        let request = CompletionRequest {
            messages: transcript.clone(),
            tools: schemas.clone(),
        };
        let response =
            match tokio::time::timeout(limits.llm_turn_timeout, llm.complete(request)).await {
                Err(_) => return NodeOutcome::Failure(NodeError::Timeout { scope: "llm-turn" }),
                Ok(Err(error)) => return NodeOutcome::Failure(error.into()),
                Ok(Ok(response)) => response,
            };
        turns += 1;
        tokens.add(response.usage);
        transcript.push(response.message.clone());

        let calls = response.message.tool_calls;
        if calls.is_empty() {
            let text = response.message.content;
            // A client-facing node parks on every text turn while it still
            // owes outputs; a resumed conversation whose required outputs
            // are all buffered is done, and the text is its closing remark.
            if node.client_facing {
                let satisfied = node
                    .required_outputs()
                    .all(|k| buffered.contains_key(k));
                if !(continuing && satisfied) {
                    return NodeOutcome::Suspend(Suspension {
                        message: text,
                        transcript,
                        buffered,
                        tokens,
                    });
                }
            }
            return NodeOutcome::Success(NodeSuccess {
                output: NodeOutput::from_map(buffered),
                tokens,
            });
        }

        let (setters, real): (Vec<_>, Vec<_>) =
            calls.into_iter().partition(|c| c.name == SET_OUTPUT_TOOL);

        if !setters.is_empty() && !real.is_empty() {
            return NodeOutcome::Failure(NodeError::MalformedOutput {
                reason: "set_output combined with other tool calls in one turn".to_string(),
            });
        }

        if !setters.is_empty() {
            for call in setters {
                match parse_set_output(&call) {
                    Ok((name, value)) => {
                        if !node.output_keys.iter().any(|k| *k == name) {
                            return NodeOutcome::Failure(NodeError::MalformedOutput {
                                reason: format!("set_output targeted undeclared key `{name}`"),
                            });
                        }
                        buffered.insert(name, value);
                        transcript
                            .push(ChatMessage::tool_result(call.id, r#"{"ok":true}"#));
                    }
                    Err(reason) => {
                        return NodeOutcome::Failure(NodeError::MalformedOutput { reason });
                    }
                }
            }
            continue;
        }

        for call in real {
            let reply = dispatch(broker, node, &call, recorder).await;
            match reply {
                Ok(value) => {
                    transcript.push(ChatMessage::tool_result(call.id, value.to_string()));
                }
                Err(error) => return NodeOutcome::Failure(error),
            }
        }
    }
}

/// Run one tool call through the broker. Structured tool errors and
/// permission refusals come back as `Ok` values the model can observe;
/// infrastructure faults come back as node failures.
async fn dispatch(
    broker: &ToolBroker,
    node: &NodeSpec,
    call: &ToolCallRequest,
    recorder: &Recorder,
) -> Result<Value, NodeError> {
    if !node.tools.iter().any(|t| *t == call.name) {
        recorder.record_problem(
            Severity::Warning,
            Some(node.id.clone()),
            format!("model called `{}`, which this node does not permit", call.name),
            Some("add the tool to the node's tool set".to_string()),
            Some(ErrorKind::ToolError),
        );
        return Ok(serde_json::json!({
            "error": { "message": format!("tool `{}` is not permitted for this step", call.name) }
        }));
    }

    let correlation_id = if call.id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        call.id.clone()
    };

    match broker
        .invoke(&call.name, call.arguments.clone(), &correlation_id)
        .await
    {
        Ok(ToolReply::Result(value)) => Ok(serde_json::json!({ "result": value })),
        Ok(ToolReply::Error(body)) => {
            recorder.record_problem(
                Severity::Warning,
                Some(node.id.clone()),
                format!("tool `{}` returned an error: {}", call.name, body.message),
                None,
                Some(ErrorKind::ToolError),
            );
            Ok(ToolReply::Error(body).to_transcript_json())
        }
        Err(BrokerError::UnknownTool { name }) => {
            recorder.record_problem(
                Severity::Warning,
                Some(node.id.clone()),
                format!("no registered server exposes `{name}`"),
                Some("register a tool server providing it".to_string()),
                Some(ErrorKind::ToolError),
            );
            Ok(serde_json::json!({
                "error": { "message": format!("tool `{name}` is not available") }
            }))
        }
        Err(BrokerError::Timeout { .. }) => {
            Err(NodeError::Timeout { scope: "tool-call" })
        }
        Err(BrokerError::TransportLost { server, .. }) => {
            Err(NodeError::ToolTransportLost { server })
        }
        Err(other) => {
            // Registry-level surprises are data to the model, not crashes.
            recorder.record_problem(
                Severity::Warning,
                Some(node.id.clone()),
                format!("tool `{}` failed: {other}", call.name),
                None,
                Some(ErrorKind::ToolError),
            );
            Ok(serde_json::json!({
                "error": { "message": other.to_string() }
            }))
        }
    }
}

fn parse_set_output(call: &ToolCallRequest) -> Result<(String, Value), String> {
    let Value::Object(args) = &call.arguments else {
        return Err("set_output arguments must be an object".to_string());
    };
    let name = args
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| "set_output requires a string `name`".to_string())?;
    let value = args
        .get("value")
        .cloned()
        .ok_or_else(|| "set_output requires a `value`".to_string())?;
    Ok((name.to_string(), value))
}
