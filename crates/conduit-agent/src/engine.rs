//! Reasoning Engine: the central ReAct control loop (spec §4.4). Drives a
//! `TaskState` through REASON → ACT → OBSERVE, consulting the `TaskMonitor`
//! for model-switch decisions and the Response Handler for completion
//! verification, until a terminal outcome or `WAITING_USER` is reached.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::brain::{Block, Brain, BrainError, ChatMessage, DecisionType, Role, ToolSpec};
use crate::context::compress_if_needed;
use crate::executor::{PlanGateState, ToolExecutor};
use crate::monitor::{RetryDecision, TaskMonitor};
use crate::response::{sanitize_output, verify_completion, CompletionVerdict, PlanSnapshot, VerificationInput};
use crate::task::{TaskState, TaskStatus};

pub const MAX_ITERATIONS: u32 = 100;
const MODEL_CALL_RETRY_SLEEP: Duration = Duration::from_secs(2);
const ASK_USER_TOOL: &str = "ask_user";
const SELF_CHECK_EVERY_N_ROUNDS: u32 = 10;
const EXTREME_SAFETY_ROUND: u32 = 50;
const LOOP_NUDGE_THRESHOLD: usize = 3;
const LOOP_FAIL_THRESHOLD: usize = 5;

/// Which front-end is driving this task — governs `no_tool_call_count`
/// caps and whether `ask_user` waits on a gateway interrupt queue or
/// returns immediately to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Chat,
    Cli,
}

/// Minimal plan-awareness the engine needs, owned by the skills layer
/// (spec §9 open question) and supplied fresh each call.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanContext {
    pub required: bool,
    pub active: bool,
    pub has_pending_step: bool,
}

impl PlanContext {
    fn gate(&self) -> PlanGateState {
        PlanGateState { plan_required: self.required, active_plan_exists: self.active }
    }

    fn snapshot(&self) -> PlanSnapshot {
        PlanSnapshot { active: self.active, has_pending_step: self.has_pending_step }
    }
}

/// Gateway-backed `ask_user` wait: send the question, poll for a reply with
/// a two-level 60s/60s timeout. CLI sessions never implement this — they
/// return the question text directly and leave the task in `WAITING_USER`.
#[async_trait]
pub trait InterruptSource: Send + Sync {
    async fn send_question(&self, session_key: &str, question: &str);
    async fn send_reminder(&self, session_key: &str);
    async fn poll_reply(&self, session_key: &str, timeout: Duration) -> Option<String>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EngineOutcome {
    Completed { text: String },
    WaitingUser { question: String },
    Failed { message: String },
    Cancelled { message: String },
}

pub struct EngineDeps<'a> {
    pub brain: &'a dyn Brain,
    pub executor: &'a ToolExecutor,
    pub monitor: &'a TaskMonitor,
    pub interrupt_source: Option<&'a dyn InterruptSource>,
    pub session_type: SessionType,
    pub session_key: &'a str,
}

/// Run the ReAct loop to completion (or `WAITING_USER`/failure) for one
/// engine invocation. `messages` is mutated in place so the caller can
/// persist the final history regardless of outcome.
pub async fn run(
    state: &mut TaskState,
    messages: &mut Vec<ChatMessage>,
    system_prompt: &str,
    tools: &[ToolSpec],
    plan: PlanContext,
    deps: &EngineDeps<'_>,
) -> EngineOutcome {
    if state.status == TaskStatus::Idle {
        let _ = state.transition(TaskStatus::Compiling);
        let _ = state.transition(TaskStatus::Reasoning);
    }

    loop {
        if state.iteration >= MAX_ITERATIONS {
            warn!(task_id = %state.task_id, "max iterations exhausted");
            return EngineOutcome::Failed {
                message: "已达到最大工具调用次数，请重新描述您的需求。".into(),
            };
        }
        state.iteration += 1;

        if state.cancelled {
            let _ = state.transition(TaskStatus::Cancelled);
            return EngineOutcome::Cancelled { message: "✅ 任务已停止。".into() };
        }

        if deps.monitor.should_switch() {
            if let Err(e) = perform_model_switch(state, messages, deps).await {
                warn!(error = %e, "model switch failed");
                let _ = state.transition(TaskStatus::Failed);
                return EngineOutcome::Failed { message: format!("模型切换失败: {e}") };
            }
        }

        if state.iteration > 1 {
            let tools_json = serde_json::to_string(tools).unwrap_or_default();
            let max_tokens = crate::context::get_max_context_tokens(deps.brain.model_info(&state.current_model).as_ref());
            let compressed = compress_if_needed(deps.brain, std::mem::take(messages), system_prompt, &tools_json, max_tokens).await;
            *messages = compressed;
        }

        let _ = state.transition(TaskStatus::Reasoning);
        let decision = match call_brain_with_retry(deps, state, messages, system_prompt, tools).await {
            Ok(decision) => decision,
            Err(outcome) => return outcome,
        };

        if decision.decision_type == DecisionType::FinalAnswer {
            if let Some(outcome) = handle_final_answer(state, messages, &decision.text_content, plan, deps).await {
                return outcome;
            }
            continue;
        }

        match handle_tool_calls(
            state,
            messages,
            &decision.tool_calls,
            decision.assistant_content.clone(),
            &decision.stop_reason,
            &decision.text_content,
            plan,
            deps,
        )
        .await
        {
            Ok(Some(outcome)) => return outcome,
            Ok(None) => continue,
            Err(outcome) => return outcome,
        }
    }
}

async fn call_brain_with_retry(
    deps: &EngineDeps<'_>,
    state: &mut TaskState,
    messages: &mut Vec<ChatMessage>,
    system_prompt: &str,
    tools: &[ToolSpec],
) -> Result<crate::brain::Decision, EngineOutcome> {
    loop {
        match deps.brain.messages_create(&state.current_model, system_prompt, tools, messages).await {
            Ok((decision, _usage)) => {
                deps.monitor.record_success();
                return Ok(decision);
            }
            Err(BrainError::Cancelled) => {
                state.cancel("llm call cancelled");
                let _ = state.transition(TaskStatus::Cancelled);
                return Err(EngineOutcome::Cancelled { message: "✅ 任务已停止。".into() });
            }
            Err(e) => {
                warn!(error = %e, model = %state.current_model, "llm call failed");
                match deps.monitor.record_failure() {
                    RetryDecision::RetryInPlace => {
                        tokio::time::sleep(MODEL_CALL_RETRY_SLEEP).await;
                        continue;
                    }
                    RetryDecision::SwitchModel => {
                        if let Err(switch_err) = perform_model_switch(state, messages, deps).await {
                            let _ = state.transition(TaskStatus::Failed);
                            return Err(EngineOutcome::Failed {
                                message: format!("连续调用失败且模型切换失败: {switch_err}"),
                            });
                        }
                        continue;
                    }
                }
            }
        }
    }
}

async fn perform_model_switch(
    state: &mut TaskState,
    messages: &mut Vec<ChatMessage>,
    deps: &EngineDeps<'_>,
) -> crate::brain::Result<()> {
    let _ = state.transition(TaskStatus::ModelSwitching);
    let fallback = deps.monitor.fallback_model().to_string();
    deps.brain.switch_endpoint(&fallback).await?;

    let mut reset_messages = state.original_user_messages.clone();
    reset_messages.push(ChatMessage::assistant_text(
        "model switched — prior tool_use/tool_result history cleared, start over",
    ));
    *messages = reset_messages;

    state.reset_for_model_switch(fallback);
    deps.monitor.record_switch_performed();
    let _ = state.transition(TaskStatus::Reasoning);
    info!(task_id = %state.task_id, model = %state.current_model, "model switch complete");
    Ok(())
}

/// Returns `Some(outcome)` to end the engine invocation, `None` to loop again.
async fn handle_final_answer(
    state: &mut TaskState,
    messages: &mut Vec<ChatMessage>,
    raw_text: &str,
    plan: PlanContext,
    deps: &EngineDeps<'_>,
) -> Option<EngineOutcome> {
    let cleaned = sanitize_output(raw_text);

    if state.tools_executed_in_task && !cleaned.is_empty() {
        let _ = state.transition(TaskStatus::Verifying);
        let verification = VerificationInput {
            user_request: &render_text(&state.original_user_messages),
            assistant_response: &cleaned,
            executed_tools: &state.tools_executed,
            delivery_receipts: &state.delivery_receipts,
            plan: plan.snapshot(),
        };
        match verify_completion(deps.brain, &verification).await {
            CompletionVerdict::Completed => {
                let _ = state.transition(TaskStatus::Completed);
                return Some(EngineOutcome::Completed { text: cleaned });
            }
            CompletionVerdict::Incomplete => {
                state.verify_incomplete_count += 1;
                let cap = if plan.active && plan.has_pending_step { 6 } else { 3 };
                if state.verify_incomplete_count >= cap {
                    let _ = state.transition(TaskStatus::Completed);
                    return Some(EngineOutcome::Completed {
                        text: format!("{cleaned}\n\n（注：任务完成情况暂无法最终确认）"),
                    });
                }
                let nudge = if plan.active {
                    "请继续执行计划中的下一个待办步骤。"
                } else {
                    "如果你认为任务已完成，请总结结果；如果还没完成，请继续。"
                };
                messages.push(ChatMessage::assistant_text(raw_text.to_string()));
                messages.push(ChatMessage::user_text(nudge));
                let _ = state.transition(TaskStatus::Reasoning);
                return None;
            }
        }
    }

    if state.tools_executed_in_task && cleaned.is_empty() {
        state.no_confirmation_text_count += 1;
        if state.no_confirmation_text_count > 1 {
            let _ = state.transition(TaskStatus::Failed);
            return Some(EngineOutcome::Failed {
                message: "⚠️ 大模型返回异常：工具已执行，但多次未返回任何可见文本确认，任务已中断。".into(),
            });
        }
        messages.push(ChatMessage::assistant_text(raw_text.to_string()));
        messages.push(ChatMessage::user_text("请对已执行的操作给出一句可见的确认文本。"));
        let _ = state.transition(TaskStatus::Reasoning);
        return None;
    }

    // No tools executed this task at all.
    state.no_tool_call_count += 1;
    let cap = if plan.active || plan.required {
        1
    } else {
        match deps.session_type {
            SessionType::Chat => 0,
            SessionType::Cli => 1,
        }
    };
    if state.no_tool_call_count > cap {
        let _ = state.transition(TaskStatus::Completed);
        return Some(EngineOutcome::Completed {
            text: if cleaned.is_empty() {
                "⚠️ 大模型未返回可见内容。".to_string()
            } else {
                cleaned
            },
        });
    }
    messages.push(ChatMessage::assistant_text(raw_text.to_string()));
    messages.push(ChatMessage::user_text("请调用合适的工具来完成这个请求。"));
    let _ = state.transition(TaskStatus::Reasoning);
    None
}

/// Returns `Ok(Some(outcome))` to end the invocation, `Ok(None)` to loop
/// again, `Err(outcome)` on a hard failure path.
async fn handle_tool_calls(
    state: &mut TaskState,
    messages: &mut Vec<ChatMessage>,
    tool_calls: &[crate::brain::ToolCallRequest],
    assistant_content: Vec<Block>,
    stop_reason: &str,
    raw_text: &str,
    plan: PlanContext,
    deps: &EngineDeps<'_>,
) -> Result<Option<EngineOutcome>, EngineOutcome> {
    let (ask_user_calls, action_calls): (Vec<_>, Vec<_>) =
        tool_calls.iter().cloned().partition(|c| c.name == ASK_USER_TOOL);

    if !ask_user_calls.is_empty() {
        let _ = state.transition(TaskStatus::Acting);
        let mut results = Vec::new();
        if !action_calls.is_empty() {
            results = deps.executor.execute_batch(&action_calls, state, deps.session_key, plan.gate()).await;
        }
        messages.push(ChatMessage { role: Role::Assistant, content: assistant_content });

        let mut result_blocks: Vec<Block> = results
            .into_iter()
            .map(|r| Block::ToolResult { tool_use_id: r.tool_use_id, content: r.content, is_error: r.is_error })
            .collect();

        let question = ask_user_calls[0].input.get("question").and_then(|q| q.as_str()).unwrap_or("").to_string();

        let _ = state.transition(TaskStatus::WaitingUser);

        match (deps.interrupt_source, deps.session_type) {
            (Some(interrupt), SessionType::Chat) => {
                interrupt.send_question(deps.session_key, &question).await;
                let reply = wait_for_reply(interrupt, deps.session_key).await;
                match reply {
                    Some(answer) => {
                        result_blocks.push(Block::ToolResult {
                            tool_use_id: ask_user_calls[0].id.clone(),
                            content: format!("用户回复：{answer}"),
                            is_error: false,
                        });
                        messages.push(ChatMessage { role: Role::User, content: result_blocks });
                        let _ = state.transition(TaskStatus::Reasoning);
                        Ok(None)
                    }
                    None => {
                        let _ = state.transition(TaskStatus::Cancelled);
                        Ok(Some(EngineOutcome::Cancelled {
                            message: "用户未在限定时间内回复，任务已终止。".into(),
                        }))
                    }
                }
            }
            _ => {
                result_blocks.push(Block::ToolResult {
                    tool_use_id: ask_user_calls[0].id.clone(),
                    content: "[等待用户回复]".into(),
                    is_error: false,
                });
                messages.push(ChatMessage { role: Role::User, content: result_blocks });
                Ok(Some(EngineOutcome::WaitingUser { question }))
            }
        }
    } else {
        run_action_batch(state, messages, &action_calls, assistant_content, stop_reason, raw_text, plan, deps).await
    }
}

async fn wait_for_reply(interrupt: &dyn InterruptSource, session_key: &str) -> Option<String> {
    const LEVEL_TIMEOUT: Duration = Duration::from_secs(60);
    if let Some(reply) = interrupt.poll_reply(session_key, LEVEL_TIMEOUT).await {
        return Some(reply);
    }
    interrupt.send_reminder(session_key).await;
    interrupt.poll_reply(session_key, LEVEL_TIMEOUT).await
}

async fn run_action_batch(
    state: &mut TaskState,
    messages: &mut Vec<ChatMessage>,
    action_calls: &[crate::brain::ToolCallRequest],
    assistant_content: Vec<Block>,
    stop_reason: &str,
    raw_text: &str,
    plan: PlanContext,
    deps: &EngineDeps<'_>,
) -> Result<Option<EngineOutcome>, EngineOutcome> {
    state.save_checkpoint(messages, summarize_decision(&assistant_content), action_calls.iter().map(|c| c.name.clone()).collect());

    let _ = state.transition(TaskStatus::Acting);
    messages.push(ChatMessage { role: Role::Assistant, content: assistant_content });

    let outcomes = deps.executor.execute_batch(action_calls, state, deps.session_key, plan.gate()).await;

    let mut batch_executed = Vec::new();
    for (call, outcome) in action_calls.iter().zip(outcomes.iter()) {
        let delivered = call.name == "deliver_artifacts" && !outcome.is_error;
        state.record_tool_result(&call.name, !outcome.is_error, delivered);
        batch_executed.push(crate::task::ExecutedTool { name: call.name.clone(), success: !outcome.is_error, delivered });
    }

    let _ = state.transition(TaskStatus::Observing);

    if state.should_rollback(&batch_executed) {
        if let Some(checkpoint) = state.pop_checkpoint() {
            *messages = checkpoint.messages_snapshot;
            messages.push(ChatMessage::user_text(format!(
                "[系统提示] 之前的方案失败了 (原因: 工具执行多次失败)。失败的决策: {}。请尝试完全不同的方法。",
                checkpoint.decision_summary
            )));
            state.reset_failure_counters();
            let _ = state.transition(TaskStatus::Reasoning);
            return Ok(None);
        }
    }

    let result_blocks: Vec<Block> = outcomes
        .into_iter()
        .map(|r| Block::ToolResult { tool_use_id: r.tool_use_id, content: r.content, is_error: r.is_error })
        .collect();
    messages.push(ChatMessage { role: Role::User, content: result_blocks });

    // §4.4.2: the model can end its turn with visible text in the same
    // round it called tools — that text is the final answer, no further
    // reasoning round needed.
    let cleaned = sanitize_output(raw_text);
    if stop_reason == "end_turn" && !cleaned.is_empty() {
        let _ = state.transition(TaskStatus::Verifying);
        let _ = state.transition(TaskStatus::Completed);
        return Ok(Some(EngineOutcome::Completed { text: cleaned }));
    }

    state.consecutive_tool_rounds += 1;

    push_round_signature(state, action_calls);
    if let Some(outcome) = apply_loop_detection(state, messages) {
        return Ok(Some(outcome));
    }

    if state.consecutive_tool_rounds > 0 && state.consecutive_tool_rounds % SELF_CHECK_EVERY_N_ROUNDS == 0 {
        let nudge = if plan.active {
            "[系统自检] 你已连续执行多轮工具调用，请对照计划核对当前进度。"
        } else {
            "[系统自检] 你已连续执行多轮工具调用，请确认是否仍在正确的方向上。"
        };
        messages.push(ChatMessage::user_text(nudge));
    }

    if state.consecutive_tool_rounds == EXTREME_SAFETY_ROUND {
        messages.push(ChatMessage::user_text(
            "[系统提示] 已连续执行 50 轮工具调用，请向用户报告当前进度并询问是否继续。",
        ));
        state.no_tool_call_count = 0;
    }

    let _ = state.transition(TaskStatus::Reasoning);
    Ok(None)
}

/// `name(sha256(params_json)[:8])` loop-detection signature. The spec's
/// reference implementation keys on `md5`; any stable short hash serves
/// the same purpose here, and `sha2` is already carried by the workspace.
fn tool_signature(call: &crate::brain::ToolCallRequest) -> String {
    let params_json = call.input.to_string();
    let digest = Sha256::digest(params_json.as_bytes());
    let short = hex_prefix(&digest, 8);
    format!("{}({})", call.name, short)
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    hex[..n.min(hex.len())].to_string()
}

fn push_round_signature(state: &mut TaskState, calls: &[crate::brain::ToolCallRequest]) {
    let mut sigs: Vec<String> = calls.iter().map(tool_signature).collect();
    sigs.sort();
    state.recent_tool_signatures.push(sigs.join("+"));
}

fn apply_loop_detection(state: &mut TaskState, messages: &mut Vec<ChatMessage>) -> Option<EngineOutcome> {
    let Some((_, count)) = state.recent_tool_signatures.most_common() else {
        return None;
    };
    if count >= LOOP_FAIL_THRESHOLD {
        let _ = state.transition(TaskStatus::Failed);
        return Some(EngineOutcome::Failed {
            message: "⚠️ 检测到工具调用陷入死循环，任务已自动终止。".into(),
        });
    }
    if count >= LOOP_NUDGE_THRESHOLD {
        messages.push(ChatMessage::user_text(
            "你正在重复相同的调用 —— 任务可能已经完成，或者需要换一种方法。",
        ));
    }
    None
}

fn summarize_decision(content: &[Block]) -> String {
    content
        .iter()
        .filter_map(|b| match b {
            Block::ToolUse { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_text(messages: &[ChatMessage]) -> String {
    messages.iter().map(|m| m.text_content()).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::{Decision, ModelInfo, ToolCallRequest, TokenUsage};
    use conduit_core::SessionId;
    use std::sync::Mutex as StdMutex;

    struct ScriptedBrain {
        decisions: StdMutex<Vec<Decision>>,
    }

    #[async_trait]
    impl Brain for ScriptedBrain {
        fn model_info(&self, _model: &str) -> Option<ModelInfo> {
            None
        }
        async fn switch_endpoint(&self, _model: &str) -> crate::brain::Result<()> {
            Ok(())
        }
        async fn messages_create(
            &self,
            _model: &str,
            _system_prompt: &str,
            _tools: &[ToolSpec],
            _messages: &[ChatMessage],
        ) -> crate::brain::Result<(Decision, TokenUsage)> {
            let mut decisions = self.decisions.lock().unwrap();
            if decisions.is_empty() {
                panic!("scripted brain exhausted");
            }
            Ok((decisions.remove(0), TokenUsage::default()))
        }
        async fn summarize(&self, _text: &str, _target: u64) -> crate::brain::Result<String> {
            Ok("STATUS: COMPLETED".into())
        }
    }

    fn final_answer(text: &str) -> Decision {
        Decision {
            decision_type: DecisionType::FinalAnswer,
            text_content: text.into(),
            tool_calls: vec![],
            thinking_content: None,
            stop_reason: "end_turn".into(),
            assistant_content: vec![Block::text(text)],
        }
    }

    #[tokio::test]
    async fn immediate_final_answer_with_no_tools_completes_in_chat_at_cap_zero() {
        let brain = ScriptedBrain { decisions: StdMutex::new(vec![final_answer("你好！")]) };
        let executor = ToolExecutor::new(1, false);
        let monitor = TaskMonitor::new(crate::monitor::MonitorConfig::default());
        let mut state = TaskState::new(SessionId::new(), "m", vec![ChatMessage::user_text("hi")]);
        let mut messages = vec![ChatMessage::user_text("hi")];
        let deps = EngineDeps {
            brain: &brain,
            executor: &executor,
            monitor: &monitor,
            interrupt_source: None,
            session_type: SessionType::Chat,
            session_key: "s1",
        };
        let outcome = run(&mut state, &mut messages, "sys", &[], PlanContext::default(), &deps).await;
        match outcome {
            EngineOutcome::Completed { text } => assert_eq!(text, "你好！"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_call_then_verified_final_answer_completes() {
        let tool_call_decision = Decision {
            decision_type: DecisionType::ToolCalls,
            text_content: String::new(),
            tool_calls: vec![ToolCallRequest { id: "c1".into(), name: "search".into(), input: serde_json::json!({"q":"x"}) }],
            thinking_content: None,
            stop_reason: "tool_use".into(),
            assistant_content: vec![Block::ToolUse { id: "c1".into(), name: "search".into(), input: serde_json::json!({"q":"x"}) }],
        };
        let brain = ScriptedBrain { decisions: StdMutex::new(vec![tool_call_decision, final_answer("已完成搜索，结果如下。")]) };
        let executor = ToolExecutor::new(1, false);
        let monitor = TaskMonitor::new(crate::monitor::MonitorConfig::default());
        let mut state = TaskState::new(SessionId::new(), "m", vec![ChatMessage::user_text("search for x")]);
        let mut messages = vec![ChatMessage::user_text("search for x")];
        let deps = EngineDeps {
            brain: &brain,
            executor: &executor,
            monitor: &monitor,
            interrupt_source: None,
            session_type: SessionType::Chat,
            session_key: "s1",
        };
        let outcome = run(&mut state, &mut messages, "sys", &[], PlanContext::default(), &deps).await;
        match outcome {
            EngineOutcome::Completed { text } => assert_eq!(text, "已完成搜索，结果如下。"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(state.tools_executed_in_task);
    }

    #[tokio::test]
    async fn repeated_identical_tool_calls_terminate_as_failed() {
        let repeating_call = || ToolCallRequest { id: "c1".into(), name: "poll".into(), input: serde_json::json!({"q":1}) };
        let decisions: Vec<Decision> = (0..6)
            .map(|_| Decision {
                decision_type: DecisionType::ToolCalls,
                text_content: String::new(),
                tool_calls: vec![repeating_call()],
                thinking_content: None,
                stop_reason: "tool_use".into(),
                assistant_content: vec![Block::ToolUse { id: "c1".into(), name: "poll".into(), input: serde_json::json!({"q":1}) }],
            })
            .collect();
        let brain = ScriptedBrain { decisions: StdMutex::new(decisions) };
        let executor = ToolExecutor::new(1, false);
        let monitor = TaskMonitor::new(crate::monitor::MonitorConfig::default());
        let mut state = TaskState::new(SessionId::new(), "m", vec![ChatMessage::user_text("poll")]);
        let mut messages = vec![ChatMessage::user_text("poll")];
        let deps = EngineDeps {
            brain: &brain,
            executor: &executor,
            monitor: &monitor,
            interrupt_source: None,
            session_type: SessionType::Chat,
            session_key: "s1",
        };
        let outcome = run(&mut state, &mut messages, "sys", &[], PlanContext::default(), &deps).await;
        match outcome {
            EngineOutcome::Failed { message } => assert!(message.contains("死循环")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_call_ending_turn_with_text_completes_without_second_round_trip() {
        let decision = Decision {
            decision_type: DecisionType::ToolCalls,
            text_content: "已完成搜索，结果如下。".into(),
            tool_calls: vec![ToolCallRequest { id: "c1".into(), name: "search".into(), input: serde_json::json!({"q":"x"}) }],
            thinking_content: None,
            stop_reason: "end_turn".into(),
            assistant_content: vec![Block::ToolUse { id: "c1".into(), name: "search".into(), input: serde_json::json!({"q":"x"}) }],
        };
        let brain = ScriptedBrain { decisions: StdMutex::new(vec![decision]) };
        let executor = ToolExecutor::new(1, false);
        let monitor = TaskMonitor::new(crate::monitor::MonitorConfig::default());
        let mut state = TaskState::new(SessionId::new(), "m", vec![ChatMessage::user_text("search for x")]);
        let mut messages = vec![ChatMessage::user_text("search for x")];
        let deps = EngineDeps {
            brain: &brain,
            executor: &executor,
            monitor: &monitor,
            interrupt_source: None,
            session_type: SessionType::Chat,
            session_key: "s1",
        };
        let outcome = run(&mut state, &mut messages, "sys", &[], PlanContext::default(), &deps).await;
        match outcome {
            EngineOutcome::Completed { text } => assert_eq!(text, "已完成搜索，结果如下。"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn signature_is_stable_for_identical_params() {
        let a = ToolCallRequest { id: "1".into(), name: "search".into(), input: serde_json::json!({"q":"x"}) };
        let b = ToolCallRequest { id: "2".into(), name: "search".into(), input: serde_json::json!({"q":"x"}) };
        assert_eq!(tool_signature(&a), tool_signature(&b));
    }
}
