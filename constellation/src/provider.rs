//! The model-provider seam.
//!
//! Provider adapters live outside the core; the framework only consumes the
//! [`ModelProvider`] trait. A provider turns a chat request into a stream of
//! [`ModelChunk`]s: text and thinking deltas as they arrive, proposed tool
//! calls, token usage, and a finish reason. Non-streaming providers simply
//! yield one delta per message part.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::tool::ToolDefinition;

/// Token usage statistics for one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens consumed.
    pub input: u64,
    /// Completion tokens produced.
    pub output: u64,
    /// Sum of input and output.
    pub total: u64,
}

impl std::ops::Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input: self.input + rhs.input,
            output: self.output + rhs.output,
            total: self.total + rhs.total,
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Who authored a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// A tool result fed back to the model.
    Tool,
}

/// One message in an agent's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Author of the message.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Tool calls proposed by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallProposal>,
    /// For `Role::Tool` messages, the id of the call this answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a tool-result message answering `call_id`.
    #[must_use]
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// A tool call proposed by the model, before scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallProposal {
    /// Provider-assigned call id.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// JSON arguments.
    pub arguments: Value,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop.
    Stop,
    /// The model wants tool results before continuing.
    ToolCalls,
    /// The provider truncated the output.
    Length,
}

/// One item of a provider's response stream.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ModelChunk {
    /// Incremental assistant text.
    TextDelta(String),
    /// Incremental thinking output.
    ThinkDelta(String),
    /// A complete proposed tool call.
    ToolCall(ToolCallProposal),
    /// Token usage for the call so far.
    Usage(Usage),
    /// Terminal chunk; no further items follow it.
    Finish(FinishReason),
}

/// A chat request handed to a provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Conversation so far, oldest first.
    pub messages: Vec<Message>,
    /// Tools the model may call.
    pub tools: Vec<ToolDefinition>,
}

/// Boxed stream of model chunks.
pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelChunk>> + Send>>;

/// A chat-completion backend.
///
/// Implementations must honor `ctx`: when the token is cancelled the stream
/// should end promptly (either cleanly or with [`crate::Error::Cancelled`]).
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Start a chat call and return its chunk stream.
    async fn chat(&self, ctx: CancellationToken, request: ChatRequest) -> Result<ModelStream>;
}
