use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies the adapter a message arrived through (e.g. "telegram", "cli").
/// Globally unique per running gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Chat/conversation identifier as assigned by the adapter (group id, DM id, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChatId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChatId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// User identifier as assigned by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque session identifier (UUIDv7 — time-sortable, useful in log correlation
/// and for JSONL conversation-history filenames that should sort by creation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Composite session key: `channel:chat_id:user_id`, the primary key per the
/// session address book.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(pub String);

impl SessionKey {
    pub fn new(channel: &ChannelId, chat_id: &ChatId, user_id: &UserId) -> Self {
        Self(format!("{}:{}:{}", channel, chat_id, user_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits back into `(channel, chat_id, user_id)`. The channel segment
    /// never contains `:`, so only the first colon is a hard separator; the
    /// remainder is split once more from the end so a `user_id` containing
    /// `:` (e.g. `qq:123:guest`) round-trips.
    pub fn parse(&self) -> Option<(ChannelId, ChatId, UserId)> {
        let mut parts = self.0.splitn(3, ':');
        let channel = parts.next()?;
        let chat_id = parts.next()?;
        let user_id = parts.next()?;
        Some((
            ChannelId::new(channel),
            ChatId::from(chat_id),
            UserId::from(user_id),
        ))
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One execution of the Reasoning Engine against a session (ephemeral, not
/// persisted beyond the trace/execution log).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection identifier for transport-level tracking (HTTP-SSE streams).
/// Random, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId(pub String);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a worker process in the optional Master-Worker orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn master() -> Self {
        Self("master".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_round_trips() {
        let channel = ChannelId::new("telegram");
        let chat_id = ChatId::from("chat-1");
        let user_id = UserId::from("user-9");
        let key = SessionKey::new(&channel, &chat_id, &user_id);
        assert_eq!(key.as_str(), "telegram:chat-1:user-9");
        let (c, ch, u) = key.parse().expect("parse");
        assert_eq!(c, channel);
        assert_eq!(ch, chat_id);
        assert_eq!(u, user_id);
    }

    #[test]
    fn session_key_handles_colons_in_user_id() {
        let key = SessionKey::new(
            &ChannelId::new("onebot"),
            &ChatId::from("group:123"),
            &UserId::from("qq:456:guest"),
        );
        let (_, chat_id, user_id) = key.parse().expect("parse");
        assert_eq!(chat_id.as_str(), "group:123");
        assert_eq!(user_id.as_str(), "qq:456:guest");
    }
}
