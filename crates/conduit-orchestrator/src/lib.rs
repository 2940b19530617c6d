//! Agent Orchestrator (spec §4.8): the per-request entrypoint. Decides
//! local vs distributed handling (only meaningful once a `MasterAgent` is
//! configured; see §4.9), then drives the Reasoning Engine with the
//! composed initial message list, system prompt, tools, task monitor,
//! session type and interrupt hook, and returns the final reply.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use conduit_agent::{
    EngineDeps, EngineOutcome, InterruptSource, PlanContext, SessionType, TaskState, ToolExecutor,
};
use conduit_agent::brain::{Brain, ChatMessage, Role, ToolSpec};
use conduit_agent::monitor::TaskMonitor;
use conduit_core::SessionId;
use conduit_gateway::{AgentHandler, MessageGateway};
use conduit_observability::Tracer;
use conduit_sessions::Session;
use conduit_worker::{should_handle_locally, MasterAgent};

/// Everything the orchestrator needs to run one request through the
/// Reasoning Engine, supplied by whoever wires the binary together
/// (prompt composition and the tools registry are out of scope per
/// spec §1 — the skills layer owns their contents).
pub struct OrchestratorDeps {
    pub brain: Arc<dyn Brain>,
    pub executor: Arc<ToolExecutor>,
    pub monitor: Arc<TaskMonitor>,
    pub tools: Vec<ToolSpec>,
    pub system_prompt: String,
    pub default_model: String,
    pub tracer: Arc<Tracer>,
    pub master: Option<Arc<MasterAgent>>,
}

pub struct Orchestrator {
    deps: OrchestratorDeps,
    interrupts: Arc<dyn InterruptSource>,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps, interrupts: Arc<dyn InterruptSource>) -> Self {
        Self { deps, interrupts }
    }

    /// `handle_request(session_id, message, ...)`: decide local vs
    /// distributed, then run the Reasoning Engine loop and return the
    /// final reply text.
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    pub async fn handle_request(
        &self,
        session: &Session,
        message: String,
        session_type: SessionType,
    ) -> String {
        let session_key = session.key.as_str().to_string();
        let session_id = SessionId::new();
        let request_id = uuid::Uuid::new_v4().to_string();

        self.deps.tracer.begin_trace(session_id.clone(), serde_json::json!({ "session_key": session_key }));

        if let Some(master) = &self.deps.master {
            if !should_handle_locally(&master.registry, message.len(), !session.context.messages.is_empty()) {
                info!(session_key = %session_key, "routing request to a worker process");
                match master
                    .dispatch(&[], &request_id, &message, serde_json::json!({ "message": message }))
                    .await
                {
                    Ok(value) => {
                        let text = value
                            .get("text")
                            .and_then(|v| v.as_str())
                            .unwrap_or("（worker 未返回文本）")
                            .to_string();
                        self.deps.tracer.end_trace(serde_json::json!({ "distributed": true }));
                        return text;
                    }
                    Err(e) => {
                        info!(error = %e, "distributed dispatch failed, falling back to local handling");
                    }
                }
            }
        }

        let original_user_messages: Vec<ChatMessage> = session
            .context
            .messages
            .iter()
            .filter(|m| m.role == "user")
            .filter(|m| m.content.get("tool_result").is_none())
            .map(|m| ChatMessage { role: Role::User, content: vec![conduit_agent::brain::Block::text(
                m.content.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            )] })
            .collect();

        let mut state = TaskState::new(session_id, self.deps.default_model.clone(), original_user_messages.clone());
        let mut messages = original_user_messages;
        messages.push(ChatMessage::user_text(message));

        let plan = PlanContext::default();
        let deps = EngineDeps {
            brain: self.deps.brain.as_ref(),
            executor: self.deps.executor.as_ref(),
            monitor: self.deps.monitor.as_ref(),
            interrupt_source: Some(self.interrupts.as_ref()),
            session_type,
            session_key: &session_key,
        };

        let outcome = conduit_agent::run(
            &mut state,
            &mut messages,
            &self.deps.system_prompt,
            &self.deps.tools,
            plan,
            &deps,
        )
        .await;

        let text = match outcome {
            EngineOutcome::Completed { text } => text,
            EngineOutcome::WaitingUser { question } => question,
            EngineOutcome::Failed { message } => message,
            EngineOutcome::Cancelled { message } => message,
        };

        self.deps.tracer.end_trace(serde_json::json!({ "status": format!("{:?}", state.status) }));
        text
    }
}

/// Adapts `Orchestrator` to the gateway's `(Session, input_text) ->
/// response_text` contract.
pub struct GatewayAgentHandler {
    pub orchestrator: Arc<Orchestrator>,
    pub session_type: SessionType,
    pub gateway: tokio::sync::OnceCell<std::sync::Weak<MessageGateway>>,
}

impl GatewayAgentHandler {
    pub fn new(orchestrator: Arc<Orchestrator>, session_type: SessionType) -> Self {
        Self { orchestrator, session_type, gateway: tokio::sync::OnceCell::new() }
    }

    /// Wired after the gateway is constructed (the gateway needs an
    /// `Arc<dyn AgentHandler>` up front, so the back-reference is set
    /// post-construction rather than threaded through the constructor).
    pub fn bind_gateway(&self, gateway: std::sync::Weak<MessageGateway>) {
        let _ = self.gateway.set(gateway);
    }
}

#[async_trait]
impl AgentHandler for GatewayAgentHandler {
    async fn handle(&self, session: Session, input_text: String) -> String {
        let session_key = session.key.as_str().to_string();
        let outcome_text = self
            .orchestrator
            .handle_request(&session, input_text, self.session_type)
            .await;

        if let Some(gateway) = self.gateway.get().and_then(|w| w.upgrade()) {
            gateway.clear_waiting(&session_key);
        }

        outcome_text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_agent::brain::{Decision, DecisionType, ModelInfo, TokenUsage};
    use conduit_agent::executor::ToolExecutor;
    use conduit_agent::monitor::MonitorConfig;
    use conduit_core::config::SessionDefaults;
    use conduit_observability::Tracer;
    use conduit_sessions::SessionManager;

    struct EchoBrain;

    #[async_trait]
    impl Brain for EchoBrain {
        fn model_info(&self, _model: &str) -> Option<ModelInfo> {
            None
        }

        async fn switch_endpoint(&self, _model: &str) -> Result<(), conduit_agent::brain::BrainError> {
            Ok(())
        }

        async fn messages_create(
            &self,
            _model: &str,
            _system_prompt: &str,
            _tools: &[ToolSpec],
            _messages: &[ChatMessage],
        ) -> Result<(Decision, TokenUsage), conduit_agent::brain::BrainError> {
            Ok((
                Decision {
                    decision_type: DecisionType::FinalAnswer,
                    text_content: "一年有 365 天（闰年 366 天）。".to_string(),
                    tool_calls: vec![],
                    thinking_content: None,
                    stop_reason: "end_turn".to_string(),
                    assistant_content: vec![],
                },
                TokenUsage::default(),
            ))
        }

        async fn summarize(&self, text: &str, _target_tokens: u64) -> Result<String, conduit_agent::brain::BrainError> {
            Ok(text.chars().take(50).collect())
        }
    }

    struct NoInterrupts;

    #[async_trait]
    impl InterruptSource for NoInterrupts {
        async fn send_question(&self, _session_key: &str, _question: &str) {}
        async fn send_reminder(&self, _session_key: &str) {}
        async fn poll_reply(&self, _session_key: &str, _wait: std::time::Duration) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn straight_through_request_returns_final_answer() {
        let tmp = tempfile::tempdir().unwrap();
        let sessions = Arc::new(
            SessionManager::load(tmp.path().join("sessions.json"), SessionDefaults::default()).unwrap(),
        );
        let session = sessions
            .get_session(
                &conduit_core::ChannelId::new("cli"),
                &conduit_core::ChatId::from("c1"),
                &conduit_core::UserId::from("u1"),
                true,
            )
            .unwrap()
            .unwrap();

        let deps = OrchestratorDeps {
            brain: Arc::new(EchoBrain),
            executor: Arc::new(ToolExecutor::new(1, false)),
            monitor: Arc::new(TaskMonitor::new(MonitorConfig::default())),
            tools: vec![],
            system_prompt: "you are a helpful assistant".to_string(),
            default_model: "primary".to_string(),
            tracer: Arc::new(Tracer::new(tmp.path().join("traces"))),
            master: None,
        };

        let orchestrator = Orchestrator::new(deps, Arc::new(NoInterrupts));
        let reply = orchestrator
            .handle_request(&session, "一年有多少天？".to_string(), SessionType::Cli)
            .await;
        assert_eq!(reply, "一年有 365 天（闰年 366 天）。");
    }
}
