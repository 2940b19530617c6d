// Wire-format compatibility: these shapes are what every adapter and the
// HTTP-SSE transport actually serialize, so they're pinned here rather than
// left to incidental coverage inside unit test modules.

use conduit_core::{ChannelId, ChatId, UserId};
use conduit_protocol::message::{Artifact, ContentBlock, OutgoingMessage, UnifiedMessage};
use conduit_protocol::sse::SseEvent;

#[test]
fn unified_message_text_round_trip() {
    let msg = UnifiedMessage::text(
        ChannelId::new("telegram"),
        "msg-1",
        ChatId::from("chat-1"),
        UserId::from("user-1"),
        "tg-42",
        "hello there",
    );
    let json = serde_json::to_string(&msg).unwrap();
    let back: UnifiedMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(back.plain_text, "hello there");
    assert_eq!(back.channel.as_str(), "telegram");
    assert_eq!(back.content.len(), 1);
    assert_eq!(back.content[0].as_text(), Some("hello there"));
}

#[test]
fn content_block_variants_tag_correctly() {
    let blocks = vec![
        ContentBlock::text("hi"),
        ContentBlock::Image {
            url: "u".into(),
            mime_type: None,
        },
        ContentBlock::Voice {
            url: "u".into(),
            duration_secs: Some(1.5),
        },
        ContentBlock::File {
            url: "u".into(),
            name: "f.pdf".into(),
            size_bytes: Some(10),
        },
    ];
    for block in &blocks {
        let json = serde_json::to_value(block).unwrap();
        assert!(json.get("kind").is_some());
    }
}

#[test]
fn outgoing_message_omits_absent_optionals() {
    let msg = OutgoingMessage::new(ChatId::from("c1"), "reply text");
    let json = serde_json::to_string(&msg).unwrap();
    assert!(!json.contains("reply_to"));
    assert!(!json.contains("thread_id"));
    assert!(!json.contains("artifacts"));
}

#[test]
fn outgoing_message_with_artifacts_serializes_them() {
    let mut msg = OutgoingMessage::new(ChatId::from("c1"), "here is your file");
    msg.artifacts = Some(vec![Artifact {
        artifact_type: "file".into(),
        path: Some("/tmp/report.pdf".into()),
        url: None,
    }]);
    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("\"artifacts\""));
    assert!(json.contains("report.pdf"));
}

#[test]
fn sse_event_tags_match_transport_vocabulary() {
    let events = vec![
        SseEvent::ThinkingStart,
        SseEvent::ThinkingDelta {
            text: "t".into(),
        },
        SseEvent::ThinkingEnd,
        SseEvent::TextDelta { text: "t".into() },
        SseEvent::ToolCallStart {
            id: "1".into(),
            name: "n".into(),
            input: serde_json::json!({}),
        },
        SseEvent::ToolCallEnd {
            id: "1".into(),
            result: serde_json::json!({}),
            is_error: false,
        },
        SseEvent::PlanCreated {
            plan_id: "p".into(),
            steps: vec!["a".into()],
        },
        SseEvent::PlanStepUpdated {
            plan_id: "p".into(),
            step_index: 0,
            status: "done".into(),
        },
        SseEvent::AskUser {
            question: "csv or json?".into(),
        },
        SseEvent::AgentSwitch {
            from_model: "a".into(),
            to_model: "b".into(),
        },
        SseEvent::Artifact {
            artifact_type: "file".into(),
            url: None,
            path: Some("/tmp/x".into()),
        },
        SseEvent::Error {
            code: "TIMEOUT".into(),
            message: "m".into(),
        },
        SseEvent::Done,
    ];
    let expected_types = [
        "thinking_start",
        "thinking_delta",
        "thinking_end",
        "text_delta",
        "tool_call_start",
        "tool_call_end",
        "plan_created",
        "plan_step_updated",
        "ask_user",
        "agent_switch",
        "artifact",
        "error",
        "done",
    ];
    for (event, expected) in events.iter().zip(expected_types.iter()) {
        let wire = event.to_wire();
        assert!(wire.starts_with("data: "));
        assert!(wire.ends_with("\n\n"));
        assert!(
            wire.contains(&format!("\"type\":\"{}\"", expected)),
            "expected {} in {}",
            expected,
            wire
        );
    }
}
