use conduit_core::{SessionKey, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Every point in the system that can be observed or intercepted by a hook.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    MessageReceived,
    MessageSent,
    ToolCall,
    ToolResult,
    AgentStart,
    AgentComplete,
    SessionStart,
    SessionEnd,
    /// Fired immediately before a request is sent to the Brain.
    /// Payload fields: model, system_prompt_len, message_count, user_id.
    LlmInput,
    /// Fired after a successful response is received from the Brain.
    /// Payload fields: model, tokens_in, tokens_out, latency_ms, stop_reason.
    LlmOutput,
    /// Fired when a Brain call fails.
    /// Payload fields: model, error.
    LlmError,
}

/// Controls when a hook fires relative to the event.
///
/// Before hooks form a blocking chain — any can halt the pipeline. After
/// hooks are best-effort observers that must not stall the caller; this is
/// also how the Observability API's span-closing side effects are wired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookTiming {
    Before,
    After,
}

/// The decision a Before hook returns to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum HookAction {
    Allow,
    Block { reason: String },
    Modify { payload: serde_json::Value },
}

/// The runtime context passed into every hook invocation. Payload is untyped
/// JSON so the engine stays decoupled from domain structs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookContext {
    pub event: HookEvent,
    pub payload: serde_json::Value,
    pub user_id: Option<UserId>,
    pub session_key: Option<SessionKey>,
    pub channel: Option<String>,
    pub timestamp: u64,
}

impl HookContext {
    pub fn new(event: HookEvent, payload: serde_json::Value) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Self {
            event,
            payload,
            user_id: None,
            session_key: None,
            channel: None,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResult {
    pub action: HookAction,
    pub duration_ms: u64,
}

impl HookResult {
    pub fn allow(duration_ms: u64) -> Self {
        Self {
            action: HookAction::Allow,
            duration_ms,
        }
    }

    pub fn block(reason: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            action: HookAction::Block {
                reason: reason.into(),
            },
            duration_ms,
        }
    }
}

/// Synchronous hook handler trait. Handlers must be cheap and non-blocking —
/// After hooks are spawned onto a Tokio task, but Before hooks run on the
/// caller's async task directly.
pub trait HookHandler: Send + Sync {
    fn handle(&self, ctx: &HookContext) -> HookResult;
}

/// A registered hook binding a name, event filter, timing, and handler.
pub struct HookDefinition {
    pub name: String,
    pub event: HookEvent,
    pub timing: HookTiming,
    pub handler: Arc<dyn HookHandler>,
    /// Lower value = earlier execution. Ties broken by registration order.
    pub priority: i32,
}

impl HookDefinition {
    pub fn new(
        name: impl Into<String>,
        event: HookEvent,
        timing: HookTiming,
        handler: Arc<dyn HookHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            event,
            timing,
            handler,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}
