//! Response Handler: output sanitation and task-completion verification.
//! Both are stateless aside from the shared `Brain` handle used for the
//! completion judge and the retrospect call.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::brain::Brain;
use crate::task::ExecutedTool;

/// Strip model-internal markers from assistant text, in this fixed order,
/// before it is shown to the user or treated as a final answer. The order
/// matters: thinking/tool-call markers are stripped before the simulated
/// tool-call line filter runs, so a marker's payload never gets mistaken
/// for a plain line to keep.
pub fn sanitize_output(text: &str) -> String {
    static THINKING: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<thinking>.*?</thinking>|<think>.*?</think>").unwrap());
    static MINIMAX_TOOL_CALL: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<minimax:tool_call>.*?(</minimax:tool_call>|$)").unwrap());
    static MINIMAX_SECTION: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)<<\|tool_calls_section_begin\|>>.*?<<\|tool_calls_section_end\|>>").unwrap()
    });
    static INVOKE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<invoke[^>]*>.*?</invoke>").unwrap());
    static RESIDUAL_CLOSERS: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"</?(thinking|think|invoke|minimax:tool_call)>|<<\|tool_calls_section_(begin|end)\|>>").unwrap()
    });
    static XML_PREAMBLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"^\s*<\?xml[^>]*\?>\s*"#).unwrap());
    static SIMULATED_CALL_LINE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\s*[A-Za-z_][A-Za-z0-9_]*\([^)]*\)\s*$").unwrap());
    static HOST_PORT_LINE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\s*[A-Za-z_][A-Za-z0-9_]*:\d+\{.*\}\s*$").unwrap());
    static JSON_TOOL_STUB_LINE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"^\s*\{\s*"tool"\s*:"#).unwrap());

    let mut out = THINKING.replace_all(text, "").to_string();
    out = MINIMAX_TOOL_CALL.replace_all(&out, "").to_string();
    out = MINIMAX_SECTION.replace_all(&out, "").to_string();
    out = INVOKE_TAG.replace_all(&out, "").to_string();
    out = RESIDUAL_CLOSERS.replace_all(&out, "").to_string();
    out = XML_PREAMBLE.replace_all(&out, "").to_string();

    let cleaned: Vec<&str> = out
        .lines()
        .filter(|line| {
            !(SIMULATED_CALL_LINE.is_match(line)
                || HOST_PORT_LINE.is_match(line)
                || JSON_TOOL_STUB_LINE.is_match(line))
        })
        .collect();

    cleaned.join("\n").trim().to_string()
}

const DELIVERY_CLAIM_PATTERNS: &[&str] = &["已发送", "已交付", "已发给你", "已发给您"];
const RETROSPECT_ERROR_PATTERNS: &[&str] = &["重复", "无效", "弯路", "错误", "超时", "失败"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionVerdict {
    Completed,
    Incomplete,
}

/// Minimal view of plan state the verification fast-paths need — owned by
/// whatever tracks plans (the skills layer, per spec §9 open questions);
/// the core only consumes it.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanSnapshot {
    pub active: bool,
    pub has_pending_step: bool,
}

pub struct VerificationInput<'a> {
    pub user_request: &'a str,
    pub assistant_response: &'a str,
    pub executed_tools: &'a [ExecutedTool],
    pub delivery_receipts: &'a [serde_json::Value],
    pub plan: PlanSnapshot,
}

/// Task-completion verification (spec §4.2). Checks fast positives and
/// negatives before falling back to an LLM judge; on judge failure defaults
/// to incomplete (never silently declares success).
pub async fn verify_completion(brain: &dyn Brain, input: &VerificationInput<'_>) -> CompletionVerdict {
    let delivered = input
        .delivery_receipts
        .iter()
        .any(|r| r.get("status").and_then(|s| s.as_str()) == Some("delivered"));
    let ran_deliver_artifacts = input.executed_tools.iter().any(|t| t.name == "deliver_artifacts");
    if ran_deliver_artifacts && delivered {
        return CompletionVerdict::Completed;
    }
    if input.executed_tools.iter().any(|t| t.name == "complete_plan") {
        return CompletionVerdict::Completed;
    }

    let claims_delivery = DELIVERY_CLAIM_PATTERNS.iter().any(|p| input.assistant_response.contains(p));
    if claims_delivery && input.delivery_receipts.is_empty() && !ran_deliver_artifacts {
        return CompletionVerdict::Incomplete;
    }

    if input.plan.active && input.plan.has_pending_step {
        return CompletionVerdict::Incomplete;
    }

    let prompt = format!(
        "You are judging whether an AI assistant's response fully completed the user's request.\n\
         Rules: chit-chat, a short direct answer, or a confirmation of successful tool execution ⇒ COMPLETED.\n\
         A partial failure where alternatives remain available ⇒ INCOMPLETE.\n\
         An acknowledged platform-level hard limit (the assistant told the user it cannot do more) ⇒ COMPLETED.\n\n\
         User request:\n{}\n\nAssistant response:\n{}\n\n\
         Respond with exactly one line: \"STATUS: COMPLETED\" or \"STATUS: INCOMPLETE\".",
        input.user_request, input.assistant_response
    );

    match brain.summarize(&prompt, 16).await {
        Ok(text) if text.to_uppercase().contains("COMPLETED") && !text.to_uppercase().contains("INCOMPLETE") => {
            CompletionVerdict::Completed
        }
        Ok(_) => CompletionVerdict::Incomplete,
        Err(e) => {
            warn!(error = %e, "completion judge call failed, defaulting to incomplete");
            CompletionVerdict::Incomplete
        }
    }
}

/// Call the Brain with a formatted execution trace when a task monitor
/// declares an overrun, then flag whether the trace mentions a known
/// error-pattern so a long-term error memory should be written. Returns
/// `(retrospect_text, should_write_error_memory)`.
pub async fn retrospect(brain: &dyn Brain, execution_trace: &str) -> (String, bool) {
    let prompt = format!(
        "Review this agent execution trace and summarize what went wrong or took too long:\n\n{execution_trace}"
    );
    match brain.summarize(&prompt, 512).await {
        Ok(text) => {
            let flagged = RETROSPECT_ERROR_PATTERNS.iter().any(|p| text.contains(p));
            (text, flagged)
        }
        Err(e) => {
            warn!(error = %e, "retrospect call failed");
            (String::new(), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_thinking_tags() {
        let input = "<thinking>internal reasoning</thinking>Here is your answer.";
        assert_eq!(sanitize_output(input), "Here is your answer.");
    }

    #[test]
    fn strips_minimax_tool_call_markers() {
        let input = "<minimax:tool_call>search(query=\"x\")</minimax:tool_call>Done.";
        assert_eq!(sanitize_output(input), "Done.");
    }

    #[test]
    fn strips_invoke_blocks() {
        let input = "<invoke name=\"search\">bad</invoke>\nFinal answer here.";
        assert_eq!(sanitize_output(input), "Final answer here.");
    }

    #[test]
    fn drops_simulated_tool_call_lines() {
        let input = "search(query=\"x\")\nActual answer text.";
        assert_eq!(sanitize_output(input), "Actual answer text.");
    }

    #[test]
    fn drops_json_tool_stub_lines() {
        let input = "{\"tool\": \"search\", \"args\": {}}\nReal content.";
        assert_eq!(sanitize_output(input), "Real content.");
    }

    #[test]
    fn preserves_normal_text() {
        let input = "一年有 365 天（闰年 366 天）。";
        assert_eq!(sanitize_output(input), input);
    }
}
