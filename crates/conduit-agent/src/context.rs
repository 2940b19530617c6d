//! Context Manager: keeps the message list fed to the Brain within the
//! model's context budget while preserving tool-use/tool-result pairing.
//! Every LLM-backed step degrades deterministically on failure — this
//! function never raises, it falls back to character truncation.

use tracing::{debug, warn};

use crate::brain::{Block, Brain, ChatMessage, ModelInfo, Role};

/// Character-class token heuristic: Chinese glyphs cost ~1 token per 1.5
/// characters, everything else ~1 per 4 characters. Minimum 1 so an empty
/// string never collapses an LLM call's accounting to zero.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 1;
    }
    let mut chinese = 0u64;
    let mut other = 0u64;
    for c in text.chars() {
        if is_chinese_char(c) {
            chinese += 1;
        } else {
            other += 1;
        }
    }
    let tokens = (chinese as f64 / 1.5) + (other as f64 / 4.0);
    (tokens.ceil() as u64).max(1)
}

fn is_chinese_char(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF | 0x20000..=0x2A6DF)
}

fn estimate_message_tokens(msg: &ChatMessage) -> u64 {
    msg.content
        .iter()
        .map(|b| match b {
            Block::Text { text } => estimate_tokens(text),
            Block::Thinking { text } => estimate_tokens(text),
            Block::ToolUse { input, .. } => estimate_tokens(&input.to_string()),
            Block::ToolResult { content, .. } => estimate_tokens(content),
        })
        .sum()
}

const FALLBACK_CONTEXT_TOKENS: u64 = 124_000;
const MIN_USABLE_WINDOW: u64 = 8192;

/// Derive the token budget available for the message list: reserve
/// `min(max_output_tokens, window/2)` for output, then take 85% of the
/// remainder. Falls back to a fixed default when the model is unknown or
/// its window is implausibly small.
pub fn get_max_context_tokens(model_info: Option<&ModelInfo>) -> u64 {
    let Some(info) = model_info else {
        return FALLBACK_CONTEXT_TOKENS;
    };
    if info.context_window < MIN_USABLE_WINDOW {
        return FALLBACK_CONTEXT_TOKENS;
    }
    let reserved_for_output = info.max_output_tokens.min(info.context_window / 2);
    let remainder = info.context_window.saturating_sub(reserved_for_output);
    ((remainder as f64) * 0.85) as u64
}

const TOOL_RESULT_COMPRESS_THRESHOLD: u64 = 5_000;
const TOOL_RESULT_TARGET_FRACTION: f64 = 0.15;
const TOOL_RESULT_MIN_TARGET: u64 = 100;
const KEEP_GROUPS_DEFAULT: usize = 4;
const KEEP_GROUPS_REDUCED: usize = 2;
const CHUNK_SIZE_TOKENS: u64 = 30_000;
const CHUNK_TARGET_FRACTION: f64 = 0.15;
const TRUNCATION_MARKER: &str = "...[内容过长，已截断]...";
const EMERGENCY_TRUNCATION_NOTICE: &str = "[系统提示] 上下文已紧急截断以适应模型窗口限制。";

/// One tool-interaction group: an assistant message with tool_use blocks
/// joined with its immediately following tool_result envelope(s), or a
/// singleton non-tool-use message. Must be compressed/kept atomically so
/// the Brain never sees a tool_use without its paired tool_result.
#[derive(Debug, Clone)]
struct Group(Vec<ChatMessage>);

impl Group {
    fn token_count(&self) -> u64 {
        self.0.iter().map(estimate_message_tokens).sum()
    }
}

fn group_messages(messages: &[ChatMessage]) -> Vec<Group> {
    let mut groups = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let msg = &messages[i];
        let has_tool_use = msg.role == Role::Assistant && msg.content.iter().any(|b| b.is_tool_use());
        if has_tool_use {
            let mut bundle = vec![msg.clone()];
            let mut j = i + 1;
            while j < messages.len() && messages[j].is_tool_result_envelope() {
                bundle.push(messages[j].clone());
                j += 1;
            }
            groups.push(Group(bundle));
            i = j;
        } else {
            groups.push(Group(vec![msg.clone()]));
            i += 1;
        }
    }
    groups
}

fn flatten(groups: &[Group]) -> Vec<ChatMessage> {
    groups.iter().flat_map(|g| g.0.clone()).collect()
}

/// Pass 1: per-message compression of oversized tool results. Any
/// `tool_result` block whose content exceeds 5,000 tokens is independently
/// summarized to 15% of its size (floor 100 tokens). On LLM failure or an
/// empty summary, falls back to head(70%)+tail(20%) character truncation.
async fn compress_oversized_tool_results(brain: &dyn crate::brain::Brain, messages: &mut [ChatMessage]) {
    for msg in messages.iter_mut() {
        if !msg.is_tool_result_envelope() {
            continue;
        }
        for block in msg.content.iter_mut() {
            if let Block::ToolResult { content, .. } = block {
                let tokens = estimate_tokens(content);
                if tokens <= TOOL_RESULT_COMPRESS_THRESHOLD {
                    continue;
                }
                let target = ((tokens as f64) * TOOL_RESULT_TARGET_FRACTION).max(TOOL_RESULT_MIN_TARGET as f64) as u64;
                match brain.summarize(content, target).await {
                    Ok(summary) if !summary.trim().is_empty() => {
                        *content = summary;
                    }
                    _ => {
                        *content = head_tail_truncate(content, 0.70, 0.20);
                    }
                }
            }
        }
    }
}

fn head_tail_truncate(text: &str, head_frac: f64, tail_frac: f64) -> String {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let head_len = ((total as f64) * head_frac) as usize;
    let tail_len = ((total as f64) * tail_frac) as usize;
    if head_len + tail_len >= total {
        return text.to_string();
    }
    let head: String = chars[..head_len].iter().collect();
    let tail: String = chars[total - tail_len..].iter().collect();
    format!("{head}{TRUNCATION_MARKER}{tail}")
}

/// Summarize a run of early groups in chunks of at most `CHUNK_SIZE_TOKENS`,
/// each to 15% of its size. If the combined chunk summaries are still more
/// than 2x the overall target, run one consolidation pass over the
/// concatenated summaries.
async fn chunked_summarize(brain: &dyn crate::brain::Brain, groups: &[Group]) -> String {
    let flat_text: Vec<String> = groups
        .iter()
        .flat_map(|g| &g.0)
        .map(render_message_for_summary)
        .collect();

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0u64;
    for line in flat_text {
        let line_tokens = estimate_tokens(&line);
        if current_tokens + line_tokens > CHUNK_SIZE_TOKENS && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push_str(&line);
        current.push('\n');
        current_tokens += line_tokens;
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    let early_tokens: u64 = groups.iter().map(|g| g.token_count()).sum();
    let overall_target = ((early_tokens as f64) * CHUNK_TARGET_FRACTION).max(TOOL_RESULT_MIN_TARGET as f64) as u64;
    let per_chunk_target = (overall_target / chunks.len().max(1) as u64).max(50);

    let mut chunk_summaries = Vec::new();
    for chunk in &chunks {
        match brain.summarize(chunk, per_chunk_target).await {
            Ok(s) if !s.trim().is_empty() => chunk_summaries.push(s),
            _ => chunk_summaries.push(head_tail_truncate(chunk, 0.70, 0.20)),
        }
    }

    let combined = chunk_summaries.join("\n");
    let combined_tokens = estimate_tokens(&combined);

    if combined_tokens > overall_target * 2 && chunk_summaries.len() > 1 {
        match brain.summarize(&combined, overall_target).await {
            Ok(s) if !s.trim().is_empty() => return s,
            _ => return head_tail_truncate(&combined, 0.70, 0.20),
        }
    }

    combined
}

fn render_message_for_summary(msg: &ChatMessage) -> String {
    let role = match msg.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    format!("{role}: {}", msg.text_content())
}

/// Recursive compression entry point. `keep_groups` starts at 4 per spec
/// and is halved to 2 on a single retry if the first pass is still over
/// `soft_limit`.
async fn compress_pass(
    brain: &dyn crate::brain::Brain,
    messages: Vec<ChatMessage>,
    soft_limit: u64,
    hard_limit: u64,
    keep_groups: usize,
    already_retried: bool,
) -> Vec<ChatMessage> {
    let groups = group_messages(&messages);

    if groups.len() <= keep_groups {
        return hard_truncation_floor(messages, hard_limit);
    }

    let split_at = groups.len() - keep_groups;
    let (early, kept) = groups.split_at(split_at);

    let summary_text = chunked_summarize(brain, early).await;

    let mut result = vec![
        ChatMessage::user_text(format!("[历史对话摘要]\n{summary_text}")),
        ChatMessage::assistant_text("好的，我已了解之前的对话概要，将继续当前任务。"),
    ];
    result.extend(flatten(kept));

    let total: u64 = result.iter().map(estimate_message_tokens).sum();
    if total > soft_limit && !already_retried {
        return Box::pin(compress_pass(brain, result, soft_limit, hard_limit, KEEP_GROUPS_REDUCED, true)).await;
    }

    hard_truncation_floor(result, hard_limit)
}

/// Step 8: if the result is still over `hard_limit` after summarization,
/// drop earliest messages outright; if still over, head+tail-truncate the
/// largest remaining messages and prepend an emergency notice.
fn hard_truncation_floor(mut messages: Vec<ChatMessage>, hard_limit: u64) -> Vec<ChatMessage> {
    let total = |msgs: &[ChatMessage]| -> u64 { msgs.iter().map(estimate_message_tokens).sum() };

    if total(&messages) <= hard_limit {
        return messages;
    }

    warn!("context compression still over hard limit, dropping earliest messages");
    while messages.len() > 2 && total(&messages) > hard_limit {
        messages.remove(0);
    }

    if total(&messages) > hard_limit {
        let mut indices: Vec<usize> = (0..messages.len()).collect();
        indices.sort_by_key(|&i| std::cmp::Reverse(estimate_message_tokens(&messages[i])));
        for idx in indices {
            if total(&messages) <= hard_limit {
                break;
            }
            if let Some(Block::Text { text }) = messages[idx].content.first_mut() {
                *text = head_tail_truncate(text, 0.5, 0.2);
            }
            for block in messages[idx].content.iter_mut() {
                if let Block::ToolResult { content, .. } = block {
                    *content = head_tail_truncate(content, 0.5, 0.2);
                }
            }
        }
        messages.insert(0, ChatMessage::assistant_text(EMERGENCY_TRUNCATION_NOTICE));
    }

    messages
}

/// `compress_if_needed` contract (spec §4.1): returns `messages` unchanged
/// if already under 70% of budget, otherwise compresses oversized tool
/// results, groups tool-interactions, summarizes everything but the last 4
/// groups, and falls back to hard truncation if still over budget. Never
/// raises — every LLM failure degrades to deterministic truncation.
pub async fn compress_if_needed(
    brain: &dyn Brain,
    mut messages: Vec<ChatMessage>,
    system_prompt: &str,
    tools_json: &str,
    max_tokens: u64,
) -> Vec<ChatMessage> {
    let overhead = estimate_tokens(system_prompt) + estimate_tokens(tools_json) + 1000;
    let hard_limit = max_tokens.saturating_sub(overhead);
    let soft_limit = ((hard_limit as f64) * 0.7) as u64;

    let total: u64 = messages.iter().map(estimate_message_tokens).sum();
    if total <= soft_limit {
        debug!(total, soft_limit, "context within budget, no compression needed");
        return messages;
    }

    compress_oversized_tool_results(brain, &mut messages).await;

    compress_pass(brain, messages, soft_limit, hard_limit, KEEP_GROUPS_DEFAULT, false).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::{Decision, DecisionType, ToolSpec, TokenUsage};
    use async_trait::async_trait;

    struct StubBrain {
        fail_summarize: bool,
    }

    #[async_trait]
    impl Brain for StubBrain {
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
            Ok((
                Decision {
                    decision_type: DecisionType::FinalAnswer,
                    text_content: String::new(),
                    tool_calls: vec![],
                    thinking_content: None,
                    stop_reason: "end_turn".into(),
                    assistant_content: vec![],
                },
                TokenUsage::default(),
            ))
        }
        async fn summarize(&self, text: &str, target_tokens: u64) -> crate::brain::Result<String> {
            if self.fail_summarize {
                return Err(crate::brain::BrainError::Parse("boom".into()));
            }
            Ok(text.chars().take((target_tokens * 3) as usize).collect())
        }
    }

    #[test]
    fn hundred_chinese_chars_estimate_around_67() {
        let text = "中".repeat(100);
        let tokens = estimate_tokens(&text);
        assert_eq!(tokens, 67);
    }

    #[test]
    fn empty_string_is_minimum_one() {
        assert_eq!(estimate_tokens(""), 1);
    }

    #[test]
    fn grouping_keeps_tool_use_with_tool_result() {
        let assistant = ChatMessage {
            role: Role::Assistant,
            content: vec![Block::ToolUse { id: "t1".into(), name: "search".into(), input: serde_json::json!({}) }],
        };
        let tool_result = ChatMessage {
            role: Role::User,
            content: vec![Block::ToolResult { tool_use_id: "t1".into(), content: "ok".into(), is_error: false }],
        };
        let messages = vec![ChatMessage::user_text("hi"), assistant, tool_result, ChatMessage::assistant_text("done")];
        let groups = group_messages(&messages);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[1].0.len(), 2);
    }

    #[tokio::test]
    async fn under_soft_limit_returns_unchanged() {
        let brain = StubBrain { fail_summarize: false };
        let messages = vec![ChatMessage::user_text("short")];
        let result = compress_if_needed(&brain, messages.clone(), "sys", "[]", 100_000).await;
        assert_eq!(result.len(), messages.len());
    }

    #[tokio::test]
    async fn oversized_history_compresses_under_soft_limit_preserving_pairs() {
        let brain = StubBrain { fail_summarize: false };
        let mut messages = vec![ChatMessage::user_text("intro message")];
        for i in 0..30 {
            let assistant = ChatMessage {
                role: Role::Assistant,
                content: vec![Block::ToolUse {
                    id: format!("id{i}"),
                    name: "search".into(),
                    input: serde_json::json!({ "q": "x".repeat(500) }),
                }],
            };
            let result = ChatMessage {
                role: Role::User,
                content: vec![Block::ToolResult {
                    tool_use_id: format!("id{i}"),
                    content: "x".repeat(4000),
                    is_error: false,
                }],
            };
            messages.push(assistant);
            messages.push(result);
        }

        let compressed = compress_if_needed(&brain, messages, "sys", "[]", 20_000).await;

        let total: u64 = compressed.iter().map(estimate_message_tokens).sum();
        let hard_limit = 20_000u64.saturating_sub(estimate_tokens("sys") + estimate_tokens("[]") + 1000);
        let soft_limit = ((hard_limit as f64) * 0.7) as u64;
        assert!(total <= soft_limit.max(hard_limit), "total={total} soft={soft_limit} hard={hard_limit}");

        // every remaining tool_use must still be paired with a tool_result
        for (i, msg) in compressed.iter().enumerate() {
            if msg.role == Role::Assistant && msg.content.iter().any(|b| b.is_tool_use()) {
                let next = compressed.get(i + 1);
                assert!(next.map(|m| m.is_tool_result_envelope()).unwrap_or(false));
            }
        }
    }

    #[tokio::test]
    async fn summarization_failure_falls_back_to_truncation() {
        let brain = StubBrain { fail_summarize: true };
        let long_content = "y".repeat(30_000);
        let mut msg = ChatMessage {
            role: Role::User,
            content: vec![Block::ToolResult { tool_use_id: "a".into(), content: long_content, is_error: false }],
        };
        let mut messages = vec![msg.clone()];
        compress_oversized_tool_results(&brain, &mut messages).await;
        msg = messages.remove(0);
        if let Block::ToolResult { content, .. } = &msg.content[0] {
            assert!(content.contains(TRUNCATION_MARKER));
        } else {
            panic!("expected tool result block");
        }
    }
}
