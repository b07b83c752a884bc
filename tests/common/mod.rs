//! Shared fixtures: graph assembly helpers, a scripted LLM client, and an
//! in-process tool transport.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Value, json};

use hivegraph::broker::{FrameOp, ReplyFrame, RequestFrame, ToolErrorBody, ToolTransport, TransportError};
use hivegraph::graph::{
    Edge, EdgeCondition, Graph, GraphConfig, GraphError, GraphHeader, GoalSpec, NodeSpec, NodeType,
};
use hivegraph::llm::{
    ChatMessage, CompletionRequest, CompletionResponse, LlmClient, LlmError, TokenUsage,
    ToolCallRequest, ToolSchema,
};
use hivegraph::recorder::{RecordedEvent, RunEvent};

// ---------------------------------------------------------------------------
// Graph assembly
// ---------------------------------------------------------------------------

pub fn header() -> GraphHeader {
    GraphHeader {
        id: "test-graph".to_string(),
        version: 1,
    }
}

pub fn goal(name: &str) -> GoalSpec {
    GoalSpec {
        id: format!("goal-{name}"),
        name: name.to_string(),
        description: format!("exercise the {name} flow"),
        success_criteria: vec![],
        constraints: vec![],
    }
}

pub fn node(id: &str, node_type: NodeType) -> NodeSpec {
    NodeSpec {
        id: id.to_string(),
        name: id.to_string(),
        node_type,
        input_keys: vec![],
        output_keys: vec![],
        nullable_keys: vec![],
        tools: vec![],
        system_prompt: None,
        client_facing: false,
        max_visits: 1,
        routes: vec![],
        route_default: None,
    }
}

pub fn func_node(id: &str, inputs: &[&str], outputs: &[&str]) -> NodeSpec {
    let mut n = node(id, NodeType::Function);
    n.input_keys = strings(inputs);
    n.output_keys = strings(outputs);
    n
}

pub fn edge(id: &str, from: &str, to: &str, condition: EdgeCondition, priority: i32) -> Edge {
    Edge {
        id: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
        condition,
        predicate: None,
        priority,
    }
}

pub fn cond_edge(id: &str, from: &str, to: &str, predicate: &str, priority: i32) -> Edge {
    Edge {
        id: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
        condition: EdgeCondition::Conditional,
        predicate: Some(predicate.to_string()),
        priority,
    }
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

pub fn entry_map(pairs: &[(&str, &str)]) -> FxHashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

pub fn string_set(items: &[&str]) -> FxHashSet<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

pub fn try_graph(
    nodes: Vec<NodeSpec>,
    edges: Vec<Edge>,
    entries: &[(&str, &str)],
    pause: &[&str],
    terminal: &[&str],
) -> Result<Graph, GraphError> {
    Graph::new(
        header(),
        goal("test"),
        nodes,
        edges,
        GraphConfig {
            entry_points: entry_map(entries),
            pause_nodes: string_set(pause),
            terminal_nodes: string_set(terminal),
        },
    )
}

pub fn graph(
    nodes: Vec<NodeSpec>,
    edges: Vec<Edge>,
    entries: &[(&str, &str)],
    pause: &[&str],
    terminal: &[&str],
) -> Graph {
    try_graph(nodes, edges, entries, pause, terminal).expect("fixture graph must validate")
}

pub fn payload(pairs: &[(&str, Value)]) -> FxHashMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Scripted LLM client
// ---------------------------------------------------------------------------

/// Replays a fixed sequence of assistant messages, one per `complete` call.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<ChatMessage>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<ChatMessage>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let next = self
            .responses
            .lock()
            .expect("script lock")
            .pop_front()
            .ok_or_else(|| LlmError::Provider {
                message: "scripted responses exhausted".to_string(),
            })?;
        Ok(CompletionResponse {
            message: next,
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
        })
    }
}

pub fn assistant_text(text: &str) -> ChatMessage {
    ChatMessage::assistant(text)
}

pub fn tool_call_msg(call_id: &str, tool: &str, args: Value) -> ChatMessage {
    ChatMessage::assistant_with_calls(
        String::new(),
        vec![ToolCallRequest {
            id: call_id.to_string(),
            name: tool.to_string(),
            arguments: args,
        }],
    )
}

pub fn set_output_msg(call_id: &str, name: &str, value: Value) -> ChatMessage {
    tool_call_msg(call_id, "set_output", json!({ "name": name, "value": value }))
}

// ---------------------------------------------------------------------------
// In-process tool transport
// ---------------------------------------------------------------------------

/// An in-process tool server: answers the catalogue with a fixed tool list
/// and echoes invocation arguments back, recording every frame it saw.
pub struct EchoTransport {
    marker: String,
    tools: Vec<ToolSchema>,
    fail_tools: Vec<String>,
    lose_next: AtomicBool,
    pub reconnects: AtomicU32,
    pub invocations: Mutex<Vec<RequestFrame>>,
}

impl EchoTransport {
    pub fn new(marker: &str, tools: &[&str]) -> Self {
        Self {
            marker: marker.to_string(),
            tools: tools.iter().map(|t| tool_schema(t)).collect(),
            fail_tools: vec![],
            lose_next: AtomicBool::new(false),
            reconnects: AtomicU32::new(0),
            invocations: Mutex::new(vec![]),
        }
    }

    /// Make `tool` answer with a structured error instead of a result.
    pub fn failing(mut self, tool: &str) -> Self {
        self.fail_tools.push(tool.to_string());
        self
    }

    /// Drop the next invocation as a transport loss.
    pub fn lose_next_call(&self) {
        self.lose_next.store(true, Ordering::SeqCst);
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().expect("invocations lock").len()
    }

    pub fn correlation_ids(&self) -> Vec<String> {
        self.invocations
            .lock()
            .expect("invocations lock")
            .iter()
            .map(|f| f.id.clone())
            .collect()
    }
}

pub fn tool_schema(name: &str) -> ToolSchema {
    ToolSchema {
        name: name.to_string(),
        description: format!("test tool {name}"),
        parameters: json!({
            "type": "object",
            "properties": { "query": { "type": "string" } }
        }),
    }
}

#[async_trait]
impl ToolTransport for EchoTransport {
    async fn handshake(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn request(&self, frame: RequestFrame) -> Result<ReplyFrame, TransportError> {
        match frame.op {
            FrameOp::Handshake | FrameOp::Shutdown => Ok(ReplyFrame {
                id: frame.id,
                result: Some(json!({})),
                error: None,
            }),
            FrameOp::ListTools => Ok(ReplyFrame {
                id: frame.id,
                result: Some(json!({ "tools": self.tools })),
                error: None,
            }),
            FrameOp::Invoke => {
                if self.lose_next.swap(false, Ordering::SeqCst) {
                    return Err(TransportError::Lost {
                        message: "synthetic loss".to_string(),
                    });
                }
                self.invocations
                    .lock()
                    .expect("invocations lock")
                    .push(frame.clone());
                let tool = frame.tool.clone().unwrap_or_default();
                if self.fail_tools.contains(&tool) {
                    return Ok(ReplyFrame {
                        id: frame.id,
                        result: None,
                        error: Some(ToolErrorBody {
                            message: format!("{tool} refused the request"),
                            code: Some("refused".to_string()),
                            data: None,
                        }),
                    });
                }
                Ok(ReplyFrame {
                    id: frame.id.clone(),
                    result: Some(json!({
                        "server": self.marker,
                        "tool": tool,
                        "echo": frame.args,
                    })),
                    error: None,
                })
            }
        }
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) {}
}

// ---------------------------------------------------------------------------
// Event queries
// ---------------------------------------------------------------------------

/// How many times `node` completed successfully, per the recorded trace.
pub fn completions_of(events: &[RecordedEvent], node: &str) -> usize {
    let needle = format!("node `{node}` completed");
    events
        .iter()
        .filter(|e| matches!(&e.event, RunEvent::Outcome(o) if o.success && o.summary == needle))
        .count()
}

pub fn run_ended_success(events: &[RecordedEvent]) -> Option<bool> {
    events.iter().rev().find_map(|e| match &e.event {
        RunEvent::RunEnded { success, .. } => Some(*success),
        _ => None,
    })
}

pub fn problems(events: &[RecordedEvent]) -> Vec<&hivegraph::recorder::Problem> {
    events
        .iter()
        .filter_map(|e| match &e.event {
            RunEvent::Problem(p) => Some(p),
            _ => None,
        })
        .collect()
}
