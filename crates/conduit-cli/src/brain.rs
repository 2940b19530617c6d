//! Placeholder `Brain`. LLM providers are an external collaborator per
//! spec §1 — this crate wires the Reasoning Engine's boundary but does
//! not implement a real provider call. Swap in a real implementation
//! (routed through `conduit_core::config::ProvidersConfig`) before
//! deploying this binary against live traffic.

use async_trait::async_trait;

use conduit_agent::brain::{Brain, BrainError, ChatMessage, Decision, ModelInfo, Result, TokenUsage, ToolSpec};

pub struct PlaceholderBrain {
    model: ModelInfo,
}

impl PlaceholderBrain {
    pub fn new(model_name: impl Into<String>, context_window: u64, max_output_tokens: u64) -> Self {
        Self { model: ModelInfo { name: model_name.into(), context_window, max_output_tokens } }
    }
}

#[async_trait]
impl Brain for PlaceholderBrain {
    fn model_info(&self, model: &str) -> Option<ModelInfo> {
        (model == self.model.name).then(|| self.model.clone())
    }

    async fn switch_endpoint(&self, _model: &str) -> Result<()> {
        Ok(())
    }

    async fn messages_create(
        &self,
        _model: &str,
        _system_prompt: &str,
        _tools: &[ToolSpec],
        messages: &[ChatMessage],
    ) -> Result<(Decision, TokenUsage)> {
        let last_user_text = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, conduit_agent::brain::Role::User))
            .map(|m| m.text_content())
            .unwrap_or_default();

        Err(BrainError::Transport(format!(
            "no LLM provider configured; would have answered: {last_user_text}"
        )))
    }

    async fn summarize(&self, text: &str, target_tokens: u64) -> Result<String> {
        let max_chars = (target_tokens as usize) * 4;
        Ok(text.chars().take(max_chars).collect())
    }
}
