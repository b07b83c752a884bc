//! Node executors: the four ways a node does its work.
//!
//! Each executor has a narrow contract with the scheduler: it receives the
//! node's input view and returns a [`NodeOutcome`] — success with buffered
//! writes, failure with a classified error, or suspension with the payload
//! and transcript needed to continue later. Executors never touch the memory
//! plane and never route; both belong to the scheduler.

mod function;
mod generate;
mod router;
mod tools;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::broker::ToolBroker;
use crate::errors::ErrorKind;
use crate::graph::{NodeSpec, NodeType};
use crate::llm::{ChatMessage, LlmClient, LlmError, TokenUsage};
use crate::memory::{InputView, NodeOutput};
use crate::predicate::PredicateError;
use crate::recorder::Recorder;
use crate::template::TemplateError;

pub use function::{FunctionError, FunctionRegistry, NodeFunction};
pub use tools::{SET_OUTPUT_TOOL, set_output_schema};

/// A node-level failure. The scheduler decides whether an `on-failure` edge
/// covers it or the run terminates.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    #[error("required input `{key}` is absent")]
    #[diagnostic(code(hivegraph::node::missing_input))]
    MissingInput { key: String },

    #[error(transparent)]
    #[diagnostic(code(hivegraph::node::template))]
    Template(#[from] TemplateError),

    #[error(transparent)]
    #[diagnostic(code(hivegraph::node::memory))]
    Memory(#[from] crate::memory::MemoryError),

    #[error(transparent)]
    #[diagnostic(code(hivegraph::node::llm))]
    Llm(#[from] LlmError),

    #[error("no llm client is configured, but node `{node}` needs one")]
    #[diagnostic(
        code(hivegraph::node::no_llm_client),
        help("supply a client with RuntimeBuilder::with_llm")
    )]
    NoLlmClient { node: String },

    #[error("event loop exhausted after {turns} turns / {tokens} tokens")]
    #[diagnostic(code(hivegraph::node::loop_exhausted))]
    LoopExhausted { turns: u32, tokens: u64 },

    #[error("llm output was malformed: {reason}")]
    #[diagnostic(code(hivegraph::node::malformed_output))]
    MalformedOutput { reason: String },

    #[error("function binding for node `{node}` failed: {message}")]
    #[diagnostic(code(hivegraph::node::function))]
    Function { node: String, message: String },

    #[error("node `{node}` has no host-provided function binding")]
    #[diagnostic(
        code(hivegraph::node::unbound),
        help("register a binding with RuntimeBuilder::with_function(\"{node}\", ...)")
    )]
    Unbound { node: String },

    #[error("router `{node}` matched no route and has no default")]
    #[diagnostic(code(hivegraph::node::no_route))]
    NoRoute { node: String },

    #[error(transparent)]
    #[diagnostic(code(hivegraph::node::predicate))]
    Predicate(#[from] PredicateError),

    #[error("transport to tool server `{server}` lost")]
    #[diagnostic(code(hivegraph::node::tool_transport_lost))]
    ToolTransportLost { server: String },

    #[error("{scope} deadline expired")]
    #[diagnostic(code(hivegraph::node::timeout))]
    Timeout { scope: &'static str },
}

impl NodeError {
    /// The trace-level classification of this failure.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::MissingInput { .. } | NodeError::Template(_) => ErrorKind::MissingInput,
            NodeError::Memory(_) => ErrorKind::MissingRequiredOutput,
            NodeError::Llm(_) | NodeError::NoLlmClient { .. } | NodeError::MalformedOutput { .. } => {
                ErrorKind::LlmError
            }
            NodeError::LoopExhausted { .. } => ErrorKind::LoopExhausted,
            NodeError::Function { .. }
            | NodeError::Unbound { .. }
            | NodeError::NoRoute { .. }
            | NodeError::Predicate(_) => ErrorKind::NodeFailure,
            NodeError::ToolTransportLost { .. } => ErrorKind::ToolTransportLost,
            NodeError::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

/// A successful execution: buffered writes plus token accounting.
#[derive(Clone, Debug, Default)]
pub struct NodeSuccess {
    pub output: NodeOutput,
    pub tokens: TokenUsage,
}

/// A mid-node suspension from a client-facing event loop: the message to
/// present to the human, and everything needed to continue afterwards.
#[derive(Clone, Debug)]
pub struct Suspension {
    pub message: String,
    pub transcript: Vec<ChatMessage>,
    pub buffered: FxHashMap<String, Value>,
    pub tokens: TokenUsage,
}

/// What an executor hands back to the scheduler.
#[derive(Debug)]
pub enum NodeOutcome {
    Success(NodeSuccess),
    Failure(NodeError),
    Suspend(Suspension),
}

/// State to continue a suspended client-facing node: its parked transcript,
/// the outputs it had buffered, and the human's reply.
#[derive(Clone, Debug)]
pub struct ResumeState {
    pub transcript: Vec<ChatMessage>,
    pub buffered: FxHashMap<String, Value>,
    pub reply: String,
}

/// Caps and deadlines applied inside executors.
#[derive(Clone, Copy, Debug)]
pub struct ExecutorLimits {
    pub llm_turn_timeout: Duration,
    pub max_loop_turns: u32,
    pub max_loop_tokens: u64,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            llm_turn_timeout: Duration::from_secs(60),
            max_loop_turns: 16,
            max_loop_tokens: 64_000,
        }
    }
}

/// Dispatches node executions to the matching variant.
pub struct NodeExecutors {
    functions: FunctionRegistry,
    llm: Option<Arc<dyn LlmClient>>,
    broker: Arc<ToolBroker>,
    limits: ExecutorLimits,
}

impl NodeExecutors {
    #[must_use]
    pub fn new(
        functions: FunctionRegistry,
        llm: Option<Arc<dyn LlmClient>>,
        broker: Arc<ToolBroker>,
        limits: ExecutorLimits,
    ) -> Self {
        Self {
            functions,
            llm,
            broker,
            limits,
        }
    }

    /// Execute `node` against its input view. `resume` is present exactly
    /// when a suspended client-facing node is being continued.
    #[tracing::instrument(skip_all, fields(node = %node.id, node_type = %node.node_type))]
    pub async fn execute(
        &self,
        node: &NodeSpec,
        view: &InputView,
        resume: Option<ResumeState>,
        recorder: &Recorder,
    ) -> NodeOutcome {
        match node.node_type {
            NodeType::Function => function::execute(&self.functions, node, view).await,
            NodeType::Router => router::execute(node, view),
            NodeType::LlmGenerate => {
                let Some(llm) = &self.llm else {
                    return NodeOutcome::Failure(NodeError::NoLlmClient {
                        node: node.id.clone(),
                    });
                };
                generate::execute(llm.as_ref(), node, view, &self.limits).await
            }
            NodeType::LlmTools => {
                let Some(llm) = &self.llm else {
                    return NodeOutcome::Failure(NodeError::NoLlmClient {
                        node: node.id.clone(),
                    });
                };
                tools::execute(
                    llm.as_ref(),
                    &self.broker,
                    node,
                    view,
                    resume,
                    &self.limits,
                    recorder,
                )
                .await
            }
        }
    }
}

/// Serialize the slice of the input view a node declared, as the first user
/// message of an LLM conversation.
pub(crate) fn view_as_user_message(node: &NodeSpec, view: &InputView) -> String {
    let projected = view.project(&node.input_keys);
    let object: serde_json::Map<String, Value> =
        projected.into_iter().collect();
    serde_json::to_string_pretty(&Value::Object(object)).unwrap_or_else(|_| "{}".to_string())
}

/// Render the node's system prompt against its declared inputs, if it has
/// one. Restricting substitution to the declared keys keeps the node's
/// memory contract honest: a template cannot smuggle in undeclared reads.
pub(crate) fn rendered_system_prompt(
    node: &NodeSpec,
    view: &InputView,
) -> Result<Option<String>, NodeError> {
    match &node.system_prompt {
        Some(template) => {
            let inputs = view.project(&node.input_keys);
            Ok(Some(crate::template::render(template, &inputs)?))
        }
        None => Ok(None),
    }
}
