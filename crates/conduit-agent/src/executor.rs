//! Tool Executor: batch dispatcher with per-handler mutual exclusion for
//! stateful tools, plan-mode gating, and structured error classification.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use crate::brain::ToolCallRequest;
use crate::task::TaskState;
use crate::tool_error::{classify_error, ToolError};

/// Handlers whose calls must never run concurrently, even across sessions —
/// a shared browser/desktop/MCP surface can't safely interleave.
pub const STATEFUL_HANDLERS: &[&str] = &["browser", "desktop", "mcp"];

/// Result of a single tool invocation, independent of how it failed.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn success(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn from_tool_error(tool_use_id: impl Into<String>, err: &ToolError) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: err.to_wire_json().to_string(),
            is_error: true,
        }
    }
}

/// A registered tool handler. Handlers that raise a typed error should
/// return `Err(ToolError)`; handlers that can only produce a generic
/// failure message return it as a plain string via `Err` using
/// [`classify_error`] inside their own implementation, or let the executor
/// classify an opaque panic-free failure path.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Handler group this tool belongs to, used for the stateful-handler
    /// mutex (`browser`, `desktop`, `mcp`) or a tool-specific name for
    /// stateless tools (its own name is fine — only the three stateful
    /// groups are ever contended).
    fn handler_group(&self) -> &str;

    async fn execute(&self, input: serde_json::Value, session_key: &str) -> Result<String, ToolError>;
}

/// Minimal plan-state view the plan-gate consults. Ownership of the actual
/// plan object lives in the skills layer (spec §9 open question); the core
/// only needs this yes/no shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanGateState {
    pub plan_required: bool,
    pub active_plan_exists: bool,
}

/// Session-scoped log buffer the executor drains into `[执行日志]` after
/// every call, surfacing warnings/errors a handler logged during execution.
#[derive(Debug, Default)]
pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
}

impl LogBuffer {
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.try_lock().expect("log buffer lock should never be contended across await points");
        lines.push_back(line.into());
        while lines.len() > 10 {
            lines.pop_front();
        }
    }

    async fn drain_last_10(&self) -> Vec<String> {
        self.lines.lock().await.iter().cloned().collect()
    }
}

pub struct ToolExecutor {
    handlers: DashMap<String, Arc<dyn ToolHandler>>,
    /// Per-handler-group mutex. Only entries for `STATEFUL_HANDLERS` are
    /// ever actually contended; other tools run without acquiring one.
    group_locks: DashMap<String, Arc<Mutex<()>>>,
    parallel_semaphore: Arc<Semaphore>,
    max_parallel: usize,
    allow_parallel_with_interrupts: bool,
    pub logs: Arc<LogBuffer>,
}

impl ToolExecutor {
    pub fn new(max_parallel: usize, allow_parallel_with_interrupts: bool) -> Self {
        Self {
            handlers: DashMap::new(),
            group_locks: DashMap::new(),
            parallel_semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
            max_parallel,
            allow_parallel_with_interrupts,
            logs: Arc::new(LogBuffer::default()),
        }
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    fn group_lock(&self, group: &str) -> Arc<Mutex<()>> {
        self.group_locks
            .entry(group.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// `execute_tool` contract: plan-gate, dispatch, classify failures into
    /// a structured JSON payload, and append the trailing `[执行日志]`
    /// block. Unknown tools produce a human-readable message, not an error
    /// throw — the LLM contract still needs a tool_result either way.
    pub async fn execute_tool(
        &self,
        call: &ToolCallRequest,
        session_key: &str,
        plan_gate: PlanGateState,
    ) -> ToolOutcome {
        if plan_gate.plan_required && !plan_gate.active_plan_exists && call.name != "create_plan" {
            return ToolOutcome::success(
                call.id.clone(),
                "[计划缺失] 该操作需要先创建执行计划。请先调用 create_plan 再继续。",
            );
        }

        let Some(handler) = self.handlers.get(&call.name).map(|h| h.clone()) else {
            return ToolOutcome::success(call.id.clone(), format!("未知工具: {}", call.name));
        };

        let group = handler.handler_group().to_string();
        let is_stateful = STATEFUL_HANDLERS.contains(&group.as_str());

        let _guard = if is_stateful {
            Some(self.group_lock(&group).lock_owned().await)
        } else {
            None
        };

        debug!(tool = %call.name, stateful = is_stateful, "executing tool");

        let outcome = match handler.execute(call.input.clone(), session_key).await {
            Ok(content) => {
                let logs = self.logs.drain_last_10().await;
                let content = append_log_block(content, &logs);
                ToolOutcome::success(call.id.clone(), content)
            }
            Err(tool_err) => ToolOutcome::from_tool_error(call.id.clone(), &tool_err),
        };

        outcome
    }

    pub async fn execute_batch(
        &self,
        calls: &[ToolCallRequest],
        state: &mut TaskState,
        session_key: &str,
        plan_gate: PlanGateState,
    ) -> Vec<ToolOutcome> {
        let parallel_ok = self.max_parallel > 1 && self.allow_parallel_with_interrupts;

        if parallel_ok {
            let futures = calls.iter().map(|call| async {
                let _permit = self.parallel_semaphore.acquire().await.ok();
                self.execute_tool(call, session_key, plan_gate).await
            });
            return futures_util::future::join_all(futures).await;
        }

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            if state.cancelled {
                results.push(ToolOutcome {
                    tool_use_id: call.id.clone(),
                    content: "[任务已被用户停止]".into(),
                    is_error: true,
                });
                continue;
            }
            let outcome = self.execute_tool(call, session_key, plan_gate).await;

            if call.name == "deliver_artifacts" {
                if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&outcome.content) {
                    if let Some(receipts) = parsed.get("receipts").and_then(|r| r.as_array()) {
                        state.delivery_receipts.extend(receipts.iter().cloned());
                    }
                }
            }

            results.push(outcome);
        }
        results
    }
}

fn append_log_block(content: String, logs: &[String]) -> String {
    if logs.is_empty() {
        return content;
    }
    let block = logs.iter().map(|l| format!("  {l}")).collect::<Vec<_>>().join("\n");
    format!("{content}\n\n[执行日志]\n{block}")
}

/// Convert any non-`ToolError` failure reachable only as a message string
/// (e.g. a caught panic payload) into the structured taxonomy.
pub fn wrap_generic_failure(tool_name: &str, message: &str) -> ToolError {
    classify_error(tool_name, None, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Duration;

    struct SlowBrowserHandler {
        counter: Arc<AtomicU32>,
        peak: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ToolHandler for SlowBrowserHandler {
        fn handler_group(&self) -> &str {
            "browser"
        }

        async fn execute(&self, _input: serde_json::Value, _session_key: &str) -> Result<String, ToolError> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(n, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.counter.fetch_sub(1, Ordering::SeqCst);
            Ok("ok".into())
        }
    }

    struct UnknownErrorHandler;

    #[async_trait]
    impl ToolHandler for UnknownErrorHandler {
        fn handler_group(&self) -> &str {
            "files"
        }

        async fn execute(&self, _input: serde_json::Value, _session_key: &str) -> Result<String, ToolError> {
            Err(classify_error("read_file", Some("FileNotFoundError"), "no such file: /x"))
        }
    }

    #[tokio::test]
    async fn stateful_handler_never_runs_concurrently() {
        let executor = Arc::new(ToolExecutor::new(4, true));
        let counter = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        executor.register(
            "browser_click",
            Arc::new(SlowBrowserHandler { counter: counter.clone(), peak: peak.clone() }),
        );

        let mut state = TaskState::new(conduit_core::SessionId::new(), "m", vec![]);
        let calls: Vec<ToolCallRequest> = (0..5)
            .map(|i| ToolCallRequest { id: format!("c{i}"), name: "browser_click".into(), input: serde_json::json!({}) })
            .collect();

        executor.execute_batch(&calls, &mut state, "session-1", PlanGateState::default()).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1, "no two browser calls should ever overlap");
    }

    #[tokio::test]
    async fn unknown_tool_returns_message_not_error() {
        let executor = ToolExecutor::new(1, false);
        let call = ToolCallRequest { id: "c1".into(), name: "does_not_exist".into(), input: serde_json::json!({}) };
        let outcome = executor.execute_tool(&call, "s1", PlanGateState::default()).await;
        assert!(!outcome.is_error);
        assert!(outcome.content.contains("未知工具"));
    }

    #[tokio::test]
    async fn classified_tool_error_serializes_error_type() {
        let executor = ToolExecutor::new(1, false);
        executor.register("read_file", Arc::new(UnknownErrorHandler));
        let call = ToolCallRequest { id: "c1".into(), name: "read_file".into(), input: serde_json::json!({}) };
        let outcome = executor.execute_tool(&call, "s1", PlanGateState::default()).await;
        assert!(outcome.is_error);
        let parsed: serde_json::Value = serde_json::from_str(&outcome.content).unwrap();
        assert_eq!(parsed["error_type"], "RESOURCE_NOT_FOUND");
    }

    #[tokio::test]
    async fn plan_gate_blocks_non_plan_tool_when_required_and_missing() {
        let executor = ToolExecutor::new(1, false);
        executor.register("read_file", Arc::new(UnknownErrorHandler));
        let call = ToolCallRequest { id: "c1".into(), name: "read_file".into(), input: serde_json::json!({}) };
        let gate = PlanGateState { plan_required: true, active_plan_exists: false };
        let outcome = executor.execute_tool(&call, "s1", gate).await;
        assert!(!outcome.is_error);
        assert!(outcome.content.contains("计划"));
    }

    #[tokio::test]
    async fn cancelled_task_short_circuits_remaining_serial_calls() {
        let executor = ToolExecutor::new(1, false);
        executor.register("read_file", Arc::new(UnknownErrorHandler));
        let mut state = TaskState::new(conduit_core::SessionId::new(), "m", vec![]);
        state.cancel("user stop");

        let calls = vec![ToolCallRequest { id: "c1".into(), name: "read_file".into(), input: serde_json::json!({}) }];
        let results = executor.execute_batch(&calls, &mut state, "s1", PlanGateState::default()).await;
        assert!(results[0].is_error);
        assert!(results[0].content.contains("已被用户停止"));
    }
}
