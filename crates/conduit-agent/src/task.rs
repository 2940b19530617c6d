//! `TaskState`: the per-request ephemeral state the Reasoning Engine drives
//! through the ReAct state machine, plus the checkpoint/rollback mechanism
//! used to recover from dead-end tool batches.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use conduit_core::{SessionId, TaskId};

use crate::brain::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Compiling,
    Reasoning,
    Acting,
    Observing,
    Verifying,
    ModelSwitching,
    WaitingUser,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// The legal transition table from spec §3. `WAITING_USER` is
    /// deliberately absent from the terminal set even though it ends an
    /// engine invocation in chat channels — the task resumes on reply.
    fn allowed_targets(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Idle => &[Compiling, Reasoning],
            Compiling => &[Reasoning, Failed, Cancelled],
            Reasoning => &[Acting, Observing, Verifying, Completed, WaitingUser, ModelSwitching, Failed, Cancelled],
            Acting => &[Observing, WaitingUser, Failed, Cancelled],
            Observing => &[Reasoning, Verifying, Failed, Cancelled],
            Verifying => &[Completed, Reasoning, Cancelled],
            ModelSwitching => &[Reasoning, Failed],
            WaitingUser => &[Reasoning, Idle, Cancelled],
            Completed | Failed | Cancelled => &[Idle],
        }
    }

    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        self.allowed_targets().contains(&target)
    }
}

/// Raised when code attempts an illegal `TaskStatus` transition. This is an
/// assertion-class failure per spec §3 — it signals a bug in the engine,
/// not a recoverable runtime condition.
#[derive(Debug, thiserror::Error)]
#[error("illegal task transition: {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Snapshot of messages + state saved just before a tool-call decision is
/// executed, so a dead-end batch of tool results can be rolled back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub messages_snapshot: Vec<ChatMessage>,
    pub iteration: u32,
    pub status_snapshot: TaskStatus,
    pub executed_tools_snapshot: Vec<String>,
    pub decision_summary: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub tool_names: Vec<String>,
}

/// Retains at most this many checkpoints; older ones are discarded as the
/// ring fills.
pub const MAX_CHECKPOINTS: usize = 5;

/// One recorded tool execution, tracked for the rollback gate (consecutive
/// failures per tool) and for the `deliver_artifacts` irreversibility check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedTool {
    pub name: String,
    pub success: bool,
    pub delivered: bool,
}

/// Bounded ring of the last N per-round tool-call signatures used by loop
/// detection. Size capped at 8 per spec §3.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureRing {
    entries: VecDeque<String>,
}

impl SignatureRing {
    const CAPACITY: usize = 8;

    pub fn push(&mut self, signature: String) {
        self.entries.push_back(signature);
        while self.entries.len() > Self::CAPACITY {
            self.entries.pop_front();
        }
    }

    /// `(signature, count)` of the most frequent entry currently in the ring.
    pub fn most_common(&self) -> Option<(String, usize)> {
        let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
        for e in &self.entries {
            *counts.entry(e.as_str()).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .max_by_key(|(_, c)| *c)
            .map(|(s, c)| (s.to_string(), c))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Per-request ephemeral state the Reasoning Engine drives through the
/// ReAct cycle. Not persisted beyond the trace/execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub status: TaskStatus,
    pub cancelled: bool,
    pub cancel_reason: Option<String>,
    pub current_model: String,
    pub iteration: u32,
    pub consecutive_tool_rounds: u32,
    pub tools_executed: Vec<ExecutedTool>,
    pub tools_executed_in_task: bool,
    pub delivery_receipts: Vec<serde_json::Value>,
    pub no_tool_call_count: u32,
    pub verify_incomplete_count: u32,
    pub no_confirmation_text_count: u32,
    pub recent_tool_signatures: SignatureRing,
    pub original_user_messages: Vec<ChatMessage>,
    #[serde(skip)]
    pub checkpoints: VecDeque<Checkpoint>,
    /// Consecutive-failure counter keyed by tool name, used by the rollback
    /// gate. Reset whenever a rollback occurs.
    #[serde(default)]
    pub consecutive_failures_by_tool: std::collections::HashMap<String, u32>,
}

impl TaskState {
    pub fn new(session_id: SessionId, model: impl Into<String>, original_user_messages: Vec<ChatMessage>) -> Self {
        Self {
            task_id: TaskId::new(),
            session_id,
            status: TaskStatus::Idle,
            cancelled: false,
            cancel_reason: None,
            current_model: model.into(),
            iteration: 0,
            consecutive_tool_rounds: 0,
            tools_executed: Vec::new(),
            tools_executed_in_task: false,
            delivery_receipts: Vec::new(),
            no_tool_call_count: 0,
            verify_incomplete_count: 0,
            no_confirmation_text_count: 0,
            recent_tool_signatures: SignatureRing::default(),
            original_user_messages,
            checkpoints: VecDeque::new(),
            consecutive_failures_by_tool: std::collections::HashMap::new(),
        }
    }

    /// Validates the transition against the legal table and applies it.
    /// Illegal transitions are an assertion-class bug — callers should
    /// treat the returned error as a panic-worthy condition in debug
    /// builds and as FAILED in production.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), IllegalTransition> {
        if !self.status.can_transition_to(to) {
            return Err(IllegalTransition { from: self.status, to });
        }
        self.status = to;
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.cancelled = true;
        self.cancel_reason = Some(reason.into());
    }

    pub fn save_checkpoint(&mut self, messages: &[ChatMessage], decision_summary: impl Into<String>, tool_names: Vec<String>) {
        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            messages_snapshot: messages.to_vec(),
            iteration: self.iteration,
            status_snapshot: self.status,
            executed_tools_snapshot: self.tools_executed.iter().map(|t| t.name.clone()).collect(),
            decision_summary: decision_summary.into(),
            timestamp: chrono::Utc::now(),
            tool_names,
        };
        self.checkpoints.push_back(checkpoint);
        while self.checkpoints.len() > MAX_CHECKPOINTS {
            self.checkpoints.pop_front();
        }
    }

    pub fn pop_checkpoint(&mut self) -> Option<Checkpoint> {
        self.checkpoints.pop_back()
    }

    pub fn record_tool_result(&mut self, name: &str, success: bool, delivered: bool) {
        self.tools_executed.push(ExecutedTool {
            name: name.to_string(),
            success,
            delivered,
        });
        self.tools_executed_in_task = true;

        let counter = self.consecutive_failures_by_tool.entry(name.to_string()).or_insert(0);
        if success {
            *counter = 0;
        } else {
            *counter += 1;
        }
    }

    pub fn reset_failure_counters(&mut self) {
        self.consecutive_failures_by_tool.clear();
    }

    /// Should-rollback gate (§4.4.2): either the entire just-executed batch
    /// failed (and nothing irreversible was delivered), or one tool has
    /// accumulated 3 consecutive failures across the task.
    pub fn should_rollback(&self, batch: &[ExecutedTool]) -> bool {
        let any_delivered = batch.iter().any(|t| t.delivered);
        let batch_all_failed = !batch.is_empty() && batch.iter().all(|t| !t.success) && !any_delivered;
        let tool_hit_threshold = self.consecutive_failures_by_tool.values().any(|&c| c >= 3);
        batch_all_failed || tool_hit_threshold
    }

    /// Reset everything the model-switch procedure (§4.4.4) clears:
    /// counters, tool-execution state, and the loop-detection ring.
    pub fn reset_for_model_switch(&mut self, new_model: impl Into<String>) {
        self.current_model = new_model.into();
        self.no_tool_call_count = 0;
        self.tools_executed_in_task = false;
        self.verify_incomplete_count = 0;
        self.tools_executed.clear();
        self.consecutive_tool_rounds = 0;
        self.recent_tool_signatures.clear();
        self.no_confirmation_text_count = 0;
        self.consecutive_failures_by_tool.clear();
        self.checkpoints.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_state() -> TaskState {
        TaskState::new(SessionId::new(), "test-model", vec![ChatMessage::user_text("hi")])
    }

    #[test]
    fn legal_transitions_succeed() {
        let mut s = new_state();
        assert!(s.transition(TaskStatus::Reasoning).is_ok());
        assert!(s.transition(TaskStatus::Acting).is_ok());
        assert!(s.transition(TaskStatus::Observing).is_ok());
        assert!(s.transition(TaskStatus::Verifying).is_ok());
        assert!(s.transition(TaskStatus::Completed).is_ok());
        assert!(s.status.is_terminal());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut s = new_state();
        // IDLE -> ACTING is not in the table.
        assert!(s.transition(TaskStatus::Acting).is_err());
    }

    #[test]
    fn waiting_user_is_not_terminal() {
        assert!(!TaskStatus::WaitingUser.is_terminal());
    }

    #[test]
    fn checkpoint_ring_caps_at_five() {
        let mut s = new_state();
        for i in 0..8 {
            s.save_checkpoint(&[ChatMessage::user_text("x")], format!("decision {i}"), vec!["t".into()]);
        }
        assert_eq!(s.checkpoints.len(), MAX_CHECKPOINTS);
        // oldest entries should have been evicted
        assert_eq!(s.checkpoints.front().unwrap().decision_summary, "decision 3");
    }

    #[test]
    fn rollback_triggers_on_full_batch_failure() {
        let s = new_state();
        let batch = vec![
            ExecutedTool { name: "a".into(), success: false, delivered: false },
            ExecutedTool { name: "b".into(), success: false, delivered: false },
        ];
        assert!(s.should_rollback(&batch));
    }

    #[test]
    fn rollback_skipped_when_partially_delivered() {
        let s = new_state();
        let batch = vec![
            ExecutedTool { name: "deliver_artifacts".into(), success: false, delivered: true },
        ];
        assert!(!s.should_rollback(&batch));
    }

    #[test]
    fn rollback_triggers_on_three_consecutive_tool_failures() {
        let mut s = new_state();
        s.record_tool_result("browser_click", false, false);
        s.record_tool_result("browser_click", false, false);
        s.record_tool_result("browser_click", false, false);
        assert!(s.should_rollback(&[]));
    }

    #[test]
    fn signature_ring_detects_repeats() {
        let mut ring = SignatureRing::default();
        for _ in 0..5 {
            ring.push("browser_get_content(abcd1234)".to_string());
        }
        let (sig, count) = ring.most_common().unwrap();
        assert_eq!(sig, "browser_get_content(abcd1234)");
        assert_eq!(count, 5);
    }
}
