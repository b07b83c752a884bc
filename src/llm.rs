//! The semantic interface to the LLM provider.
//!
//! The runtime does not ship a provider client. Hosts implement [`LlmClient`]
//! over whichever SDK they use; the executors only need one operation: given
//! a transcript and the permitted tool schemas, produce the next assistant
//! message (text, tool calls, or both) with token accounting.
//!
//! Transcripts are serializable so a suspended client-facing node can park
//! its conversation in the run snapshot and continue after resume.

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Who authored a transcript message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    /// A tool result being fed back to the model.
    Tool,
}

impl ChatRole {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider-assigned call id; doubles as the broker correlation id.
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One message of an LLM conversation.
///
/// # Examples
///
/// ```
/// use hivegraph::llm::ChatMessage;
///
/// let system = ChatMessage::system("You are a research planner.");
/// let user = ChatMessage::user("Plan a survey of crates.");
/// assert_eq!(system.role.as_str(), "system");
/// assert!(user.tool_calls.is_empty());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Tool invocations attached to an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// For `Tool` messages: the id of the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    /// An assistant message carrying tool invocations.
    #[must_use]
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    /// A tool result answering the call with id `call_id`.
    #[must_use]
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Schema of a callable tool, as advertised to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

/// Token accounting for one provider call, accumulated per node and per run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// One request to the provider: the transcript so far plus permitted tools.
#[derive(Clone, Debug, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
}

/// The provider's next assistant message with usage.
#[derive(Clone, Debug)]
pub struct CompletionResponse {
    pub message: ChatMessage,
    pub usage: TokenUsage,
}

/// Provider-side failure.
#[derive(Debug, Error, Diagnostic)]
pub enum LlmError {
    #[error("llm provider error: {message}")]
    #[diagnostic(code(hivegraph::llm::provider))]
    Provider { message: String },

    #[error("llm response was unusable: {reason}")]
    #[diagnostic(code(hivegraph::llm::malformed))]
    Malformed { reason: String },
}

/// Object-safe seam to the LLM provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Produce the next assistant message for the given transcript.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}
