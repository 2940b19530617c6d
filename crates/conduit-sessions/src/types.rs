use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use conduit_core::SessionKey;

/// Lifecycle state of a conversation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Idle,
    Expired,
    Closed,
}

/// A single entry in a session's bounded conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl HistoryMessage {
    pub fn new(role: impl Into<String>, content: impl Into<serde_json::Value>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            meta: serde_json::Map::new(),
        }
    }

    /// First 80 characters of the content rendered as a flat string, used when
    /// building the synthetic summary block for dropped history.
    pub fn preview(&self) -> String {
        let text = match &self.content {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        text.chars().take(80).collect()
    }
}

/// The mutable conversation state carried by a session.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionContext {
    pub messages: Vec<HistoryMessage>,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Per-session overrides merged on top of global defaults at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    pub max_history: Option<usize>,
    pub model: Option<String>,
}

/// A persisted conversation session, keyed by `channel:chat_id:user_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub key: SessionKey,
    pub state: SessionState,
    pub context: SessionContext,
    pub config: SessionConfig,
    /// Arbitrary metadata. Keys starting with `_` are transient — stripped
    /// before serialization to disk (e.g. `_gateway`, `_session_key`, which
    /// the Reasoning Engine uses to reach back into the live gateway without
    /// persisting a dangling reference).
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: String,
    pub last_active: String,
}

impl Session {
    pub fn new(id: String, key: SessionKey, config: SessionConfig) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id,
            key,
            state: SessionState::Active,
            context: SessionContext::default(),
            config,
            metadata: serde_json::Map::new(),
            created_at: now.clone(),
            last_active: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_active = chrono::Utc::now().to_rfc3339();
        if self.state == SessionState::Idle {
            self.state = SessionState::Active;
        }
    }

    pub fn is_expired(&self, timeout_minutes: i64) -> bool {
        let last_active = chrono::DateTime::parse_from_rfc3339(&self.last_active)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now());
        chrono::Utc::now() - last_active > chrono::Duration::minutes(timeout_minutes)
    }

    /// Strips `_`-prefixed metadata keys, which are process-local handles
    /// (live gateway/session-key references) that cannot round-trip through
    /// JSON and must never be persisted.
    pub fn strip_transient_metadata(&mut self) {
        self.metadata.retain(|k, _| !k.starts_with('_'));
    }
}

/// The file-level shape of `sessions.json`: a flat map from the formatted
/// session key string to its session record.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionStore {
    pub sessions: HashMap<String, Session>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_to_80_chars() {
        let msg = HistoryMessage::new("user", "x".repeat(200));
        assert_eq!(msg.preview().chars().count(), 80);
    }

    #[test]
    fn strip_transient_metadata_removes_underscore_keys() {
        let key = SessionKey::new(
            &conduit_core::ChannelId::new("cli"),
            &conduit_core::ChatId::from("c1"),
            &conduit_core::UserId::from("u1"),
        );
        let mut session = Session::new("id-1".into(), key, SessionConfig::default());
        session
            .metadata
            .insert("_gateway".into(), serde_json::json!("handle"));
        session
            .metadata
            .insert("title".into(), serde_json::json!("kept"));
        session.strip_transient_metadata();
        assert!(!session.metadata.contains_key("_gateway"));
        assert!(session.metadata.contains_key("title"));
    }
}
