//! The `Brain` capability boundary: everything the Reasoning Engine knows
//! about an LLM provider. Producing the actual completion is out of scope
//! (see spec §1) — this module only fixes the shapes that cross the
//! boundary so the engine can stay provider-agnostic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One block of structured message content. Every component that inspects
/// a message's content must handle all four variants — this is the
/// dynamic-content sum-type called for in the design notes, with an
/// explicit `kind` tag so serialization stays stable across the JSON
/// persistence boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Block {
    Text { text: String },
    Thinking { text: String },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl Block {
    pub fn text(s: impl Into<String>) -> Self {
        Block::Text { text: s.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Block::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Block::ToolUse { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Block::ToolResult { .. })
    }

    pub fn tool_use_id(&self) -> Option<&str> {
        match self {
            Block::ToolUse { id, .. } => Some(id),
            Block::ToolResult { tool_use_id, .. } => Some(tool_use_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One turn in the message list sent to the Brain. A `role=User` message
/// whose content is entirely `ToolResult` blocks is the tool-result
/// envelope described in the data model — not a human turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<Block>,
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![Block::text(text)],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![Block::text(text)],
        }
    }

    pub fn is_tool_result_envelope(&self) -> bool {
        self.role == Role::User
            && !self.content.is_empty()
            && self.content.iter().all(|b| b.is_tool_result())
    }

    pub fn tool_use_blocks(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                Block::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
                _ => None,
            })
            .collect()
    }

    /// Concatenated text of every `Text` block, used wherever "the cleaned
    /// text of a message" is needed (verification, logging, display).
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| b.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A tool-call request parsed out of a Decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    FinalAnswer,
    ToolCalls,
}

/// The parsed shape of one LLM turn, as handed from the Brain boundary to
/// the Reasoning Engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision_type: DecisionType,
    pub text_content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub thinking_content: Option<String>,
    pub stop_reason: String,
    pub assistant_content: Vec<Block>,
}

impl Decision {
    pub fn is_final_answer(&self) -> bool {
        self.decision_type == DecisionType::FinalAnswer
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Declared shape of a model the registry knows about, used by the
/// Context Manager to size the compression budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub context_window: u64,
    pub max_output_tokens: u64,
}

/// A tool schema exposed to the Brain alongside the message list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Error)]
pub enum BrainError {
    #[error("http/transport error: {0}")]
    Transport(String),
    #[error("model endpoint resolution failed for '{0}'")]
    UnknownEndpoint(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("provider returned an unparseable response: {0}")]
    Parse(String),
    #[error("call cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, BrainError>;

/// The one capability the Reasoning Engine needs from an LLM provider:
/// turn a `(model, system_prompt, tools, messages)` request into a typed
/// `Decision`, with token accounting. Everything about how that decision
/// gets produced — routing, retries, streaming — lives on the other side
/// of this trait (out of scope per spec §1).
#[async_trait]
pub trait Brain: Send + Sync {
    /// Current declared shape of `model`, used to size the context budget.
    /// `None` if the model is unknown to the registry (the Context Manager
    /// falls back to a conservative default in that case).
    fn model_info(&self, model: &str) -> Option<ModelInfo>;

    /// Resolve a model name to a live endpoint, switching the active
    /// connection for subsequent calls. Used by model-switch on repeated
    /// timeouts (§4.4.4). Fails if the name has no registered endpoint.
    async fn switch_endpoint(&self, model: &str) -> Result<()>;

    async fn messages_create(
        &self,
        model: &str,
        system_prompt: &str,
        tools: &[ToolSpec],
        messages: &[ChatMessage],
    ) -> Result<(Decision, TokenUsage)>;

    /// Cheap summarization call used by the Context Manager for oversized
    /// tool-result and chunked-history compression. Implementations may
    /// route this to a smaller/cheaper model than `messages_create`.
    async fn summarize(&self, text: &str, target_tokens: u64) -> Result<String>;
}
