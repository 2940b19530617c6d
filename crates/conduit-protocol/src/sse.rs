use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line-delimited `data: {json}\n\n` event on the HTTP-SSE transport.
/// Wire shape matches the original WS `EventFrame`'s discriminator style but
/// every event here corresponds 1:1 to a reasoning-loop milestone rather
/// than a generic pub/sub push.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SseEvent {
    ThinkingStart,
    ThinkingDelta { text: String },
    ThinkingEnd,
    TextDelta { text: String },
    ToolCallStart { id: String, name: String, input: Value },
    ToolCallEnd { id: String, result: Value, is_error: bool },
    PlanCreated { plan_id: String, steps: Vec<String> },
    PlanStepUpdated { plan_id: String, step_index: usize, status: String },
    AskUser { question: String },
    AgentSwitch { from_model: String, to_model: String },
    Artifact { artifact_type: String, url: Option<String>, path: Option<String> },
    Error { code: String, message: String },
    Done,
}

impl SseEvent {
    /// Render as a single SSE wire line, ending in the required blank line.
    pub fn to_wire(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {}\n\n", json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_spec_vocabulary() {
        let event = SseEvent::TextDelta {
            text: "hi".to_string(),
        };
        let wire = event.to_wire();
        assert!(wire.starts_with("data: "));
        assert!(wire.ends_with("\n\n"));
        assert!(wire.contains("\"type\":\"text_delta\""));
    }

    #[test]
    fn done_has_no_extra_fields() {
        let wire = SseEvent::Done.to_wire();
        assert!(wire.contains("\"type\":\"done\""));
    }
}
