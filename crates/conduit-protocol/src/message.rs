use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conduit_core::{ChannelId, ChatId, UserId};

/// One block of structured message content. Every component that inspects a
/// message's `content` must handle all four variants — text is the common
/// case, the others arrive from richer adapters (Telegram/Feishu voice
/// notes, image uploads, file shares).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { url: String, mime_type: Option<String> },
    Voice { url: String, duration_secs: Option<f64> },
    File { url: String, name: String, size_bytes: Option<u64> },
}

impl ContentBlock {
    pub fn text(s: impl Into<String>) -> Self {
        ContentBlock::Text { text: s.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Immutable record produced by any channel adapter.
///
/// Invariant: `channel` is globally unique per adapter; `(channel,
/// channel_message_id)` is globally unique — an adapter must never reuse
/// a message id it has already emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub id: String,
    pub channel: ChannelId,
    pub channel_message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub channel_user_id: String,
    pub plain_text: String,
    pub content: Vec<ContentBlock>,
    pub arrival_time: DateTime<Utc>,
}

impl UnifiedMessage {
    pub fn text(
        channel: ChannelId,
        channel_message_id: impl Into<String>,
        chat_id: ChatId,
        user_id: UserId,
        channel_user_id: impl Into<String>,
        plain_text: impl Into<String>,
    ) -> Self {
        let plain_text = plain_text.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel,
            channel_message_id: channel_message_id.into(),
            thread_id: None,
            chat_id,
            user_id,
            channel_user_id: channel_user_id.into(),
            content: vec![ContentBlock::text(plain_text.clone())],
            plain_text,
            arrival_time: Utc::now(),
        }
    }
}

/// An artifact (file/image/voice payload) attached to an outgoing reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub path: Option<String>,
    pub url: Option<String>,
}

/// Reply envelope handed from the agent back to the gateway for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub chat_id: ChatId,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<Artifact>>,
}

impl OutgoingMessage {
    pub fn new(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            reply_to: None,
            thread_id: None,
            artifacts: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_tags_round_trip() {
        let block = ContentBlock::Image {
            url: "https://x/y.png".into(),
            mime_type: Some("image/png".into()),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["kind"], "image");
        let back: ContentBlock = serde_json::from_value(json).unwrap();
        assert!(matches!(back, ContentBlock::Image { .. }));
    }
}
