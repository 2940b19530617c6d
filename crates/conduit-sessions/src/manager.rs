use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::{interval, Duration};
use tracing::{debug, info, instrument, warn};

use conduit_core::config::SessionDefaults;
use conduit_core::SessionKey;

use crate::error::{Result, SessionError};
use crate::types::{HistoryMessage, Session, SessionConfig, SessionState, SessionStore};

const ARCHIVE_AFTER_HOURS: i64 = 1;
const ARCHIVE_SUMMARY_ZH: &str = "之前的对话已归档（超过 1 小时未活跃）";
const ROLE_FILLER_ZH: &str = "好的，我已了解之前的对话概要。";
const TOOL_RESULT_MAX_BYTES: usize = 10 * 1024;
const IMAGE_PLACEHOLDER_ZH: &str = "[图片数据已清理，请重新截图]";

/// In-memory registry of all live sessions, keyed by `channel:chat_id:user_id`.
///
/// Mutations go through this manager exclusively so the dirty flag and the
/// role-alternation invariant around history truncation stay consistent.
/// A single instance should be wrapped in `Arc` and shared across the
/// gateway's worker tasks.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    defaults: SessionDefaults,
    store_path: std::path::PathBuf,
    dirty: AtomicBool,
}

impl SessionManager {
    /// Load `sessions.json` from `store_path` (if present) and apply the
    /// stale-context purge described for reload: sessions idle over an hour
    /// have their history cleared and replaced with an archive notice;
    /// sessions within the hour get oversized tool_result blocks cleaned.
    pub fn load(store_path: std::path::PathBuf, defaults: SessionDefaults) -> Result<Self> {
        let mut store: SessionStore = conduit_core::atomic::read_json(&store_path)?;

        for session in store.sessions.values_mut() {
            purge_stale_context(session);
        }

        info!(count = store.sessions.len(), "sessions loaded");

        Ok(Self {
            sessions: Mutex::new(store.sessions),
            defaults,
            store_path,
            dirty: AtomicBool::new(false),
        })
    }

    /// `get_session` contract: O(1) lookup on the in-memory map. On hit, if
    /// expired, mark expired and evict; otherwise touch `last_active`. On
    /// miss with `create_if_missing`, instantiate with merged config.
    #[instrument(skip(self), fields(channel, chat_id, user_id))]
    pub fn get_session(
        &self,
        channel: &conduit_core::ChannelId,
        chat_id: &conduit_core::ChatId,
        user_id: &conduit_core::UserId,
        create_if_missing: bool,
    ) -> Result<Option<Session>> {
        let key = SessionKey::new(channel, chat_id, user_id);
        let key_str = key.as_str().to_string();

        let mut sessions = self.sessions.lock().unwrap();

        if let Some(session) = sessions.get_mut(&key_str) {
            if session.is_expired(self.defaults.timeout_minutes as i64) {
                session.state = SessionState::Expired;
                let expired = sessions.remove(&key_str);
                self.mark_dirty();
                debug!(key = %key_str, "session expired on access, evicted");
                return Ok(expired);
            }
            session.touch();
            self.mark_dirty();
            return Ok(Some(sessions.get(&key_str).unwrap().clone()));
        }

        if !create_if_missing {
            return Ok(None);
        }

        let session = Session::new(
            conduit_core::types::TaskId::new().as_str().to_string(),
            key,
            SessionConfig::default(),
        );
        sessions.insert(key_str, session.clone());
        self.mark_dirty();
        Ok(Some(session))
    }

    /// `add_message` contract: append, and when the history exceeds
    /// `max_history`, drop the earliest quartile, replacing it with a
    /// synthetic summary message built from role-prefixed 80-char previews
    /// of its last 20 entries. If the first surviving message is user-role,
    /// insert an assistant filler to preserve strict role alternation.
    #[instrument(skip(self, content), fields(key = %key, role))]
    pub fn add_message(
        &self,
        key: &SessionKey,
        role: &str,
        content: serde_json::Value,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(key.as_str())
            .ok_or_else(|| SessionError::NotFound {
                key: key.as_str().to_string(),
            })?;

        session.context.messages.push(HistoryMessage::new(role, content));
        session.touch();

        let max_history = session.config.max_history.unwrap_or(self.defaults.max_history);
        if session.context.messages.len() > max_history {
            truncate_with_summary(session);
        }

        drop(sessions);
        self.mark_dirty();
        Ok(())
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Snapshot every session under the lock, clear the dirty flag, and
    /// write atomically. Overlapping calls are safe: each snapshot is taken
    /// under the lock, so a concurrent save sees a consistent view, never a
    /// torn write.
    pub fn save_if_dirty(&self) -> Result<bool> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        let snapshot = {
            let sessions = self.sessions.lock().unwrap();
            SessionStore {
                sessions: sessions
                    .iter()
                    .map(|(k, v)| {
                        let mut v = v.clone();
                        v.strip_transient_metadata();
                        (k.clone(), v)
                    })
                    .collect(),
            }
        };

        conduit_core::atomic::write_json(&self.store_path, &snapshot)?;
        debug!(path = %self.store_path.display(), "sessions saved");
        Ok(true)
    }

    /// Expire sessions past `timeout_minutes` and evict anything already
    /// expired or closed. Intended to run from a background loop on
    /// `cleanup_interval_seconds`.
    pub fn cleanup(&self) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        let timeout = self.defaults.timeout_minutes as i64;
        let before = sessions.len();

        sessions.retain(|_, session| {
            if session.is_expired(timeout) {
                return false;
            }
            matches!(session.state, SessionState::Active | SessionState::Idle)
        });

        let evicted = before - sessions.len();
        if evicted > 0 {
            drop(sessions);
            self.mark_dirty();
            debug!(evicted, "sessions evicted by cleanup");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Snapshot every live session under the lock. Read-only: does not touch
    /// the dirty flag. Used by the gateway's `broadcast` to enumerate
    /// candidate chats without reaching into the manager's internals.
    pub fn all_sessions(&self) -> Vec<Session> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }
}

/// Drop the earliest quartile of `session.context.messages`, replacing it
/// with one synthetic user message summarizing what was dropped (last 20
/// entries of the dropped slice only, each as `role: first-80-chars`).
fn truncate_with_summary(session: &mut Session) {
    let total = session.context.messages.len();
    let drop_count = total / 4;
    if drop_count == 0 {
        return;
    }

    let dropped: Vec<HistoryMessage> = session.context.messages.drain(..drop_count).collect();
    let tail: &[HistoryMessage] = if dropped.len() > 20 {
        &dropped[dropped.len() - 20..]
    } else {
        &dropped[..]
    };

    let summary_lines: Vec<String> = tail
        .iter()
        .map(|m| format!("{}: {}", m.role, m.preview()))
        .collect();
    let summary_text = summary_lines.join("\n");

    session.context.summary = Some(summary_text.clone());

    let mut synthetic = vec![HistoryMessage::new(
        "user",
        serde_json::json!(format!("[对话历史摘要]\n{}", summary_text)),
    )];

    if session
        .context
        .messages
        .first()
        .map(|m| m.role == "user")
        .unwrap_or(false)
    {
        synthetic.push(HistoryMessage::new("assistant", serde_json::json!(ROLE_FILLER_ZH)));
    }

    synthetic.extend(session.context.messages.drain(..));
    session.context.messages = synthetic;
}

fn purge_stale_context(session: &mut Session) {
    let last_active = chrono::DateTime::parse_from_rfc3339(&session.last_active)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now());
    let age = chrono::Utc::now() - last_active;

    if age > chrono::Duration::hours(ARCHIVE_AFTER_HOURS) {
        session.context.messages.clear();
        session.context.summary = Some(ARCHIVE_SUMMARY_ZH.to_string());
        return;
    }

    for message in session.context.messages.iter_mut() {
        clean_oversized_tool_result(message);
    }
}

fn clean_oversized_tool_result(message: &mut HistoryMessage) {
    if message.role != "tool" && message.role != "tool_result" {
        return;
    }

    if let serde_json::Value::String(text) = &message.content {
        if text.len() > TOOL_RESULT_MAX_BYTES {
            let looks_like_base64_image = text.starts_with("data:image")
                || (text.len() > 100 && text.chars().take(50).all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '='));

            message.content = if looks_like_base64_image {
                serde_json::json!(IMAGE_PLACEHOLDER_ZH)
            } else {
                let head: String = text.chars().take(TOOL_RESULT_MAX_BYTES / 2).collect();
                serde_json::json!(format!("{}... [truncated]", head))
            };
        }
    }
}

/// Background save loop: every `save_delay_seconds`, persist if dirty.
/// Callers should `tokio::spawn` this and keep the `JoinHandle` so the
/// process can abort it (after draining one final save) on shutdown.
pub async fn run_save_loop(manager: Arc<SessionManager>, save_delay_seconds: u64) {
    let mut ticker = interval(Duration::from_secs(save_delay_seconds.max(1)));
    loop {
        ticker.tick().await;
        if let Err(e) = manager.save_if_dirty() {
            warn!(error = %e, "periodic session save failed");
        }
    }
}

/// Background cleanup loop: every `cleanup_interval_seconds`, expire and
/// evict stale sessions.
pub async fn run_cleanup_loop(manager: Arc<SessionManager>, cleanup_interval_seconds: u64) {
    let mut ticker = interval(Duration::from_secs(cleanup_interval_seconds.max(1)));
    loop {
        ticker.tick().await;
        let evicted = manager.cleanup();
        if evicted > 0 {
            info!(evicted, "session cleanup pass complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{ChannelId, ChatId, UserId};

    fn key(n: &str) -> SessionKey {
        SessionKey::new(&ChannelId::new("cli"), &ChatId::from(n), &UserId::from("u1"))
    }

    fn new_manager() -> (tempfile::TempDir, SessionManager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let manager = SessionManager::load(path, SessionDefaults::default()).unwrap();
        (dir, manager)
    }

    #[test]
    fn get_or_create_then_fetch() {
        let (_dir, manager) = new_manager();
        let channel = ChannelId::new("cli");
        let chat = ChatId::from("c1");
        let user = UserId::from("u1");

        let created = manager
            .get_session(&channel, &chat, &user, true)
            .unwrap()
            .expect("created");
        let fetched = manager
            .get_session(&channel, &chat, &user, false)
            .unwrap()
            .expect("fetched");
        assert_eq!(created.id, fetched.id);
    }

    #[test]
    fn add_message_truncates_and_inserts_filler() {
        let (_dir, manager) = new_manager();
        let k = key("c2");
        manager.get_session(&ChannelId::new("cli"), &ChatId::from("c2"), &UserId::from("u1"), true).unwrap();

        for i in 0..10 {
            let role = if i % 2 == 0 { "user" } else { "assistant" };
            manager
                .add_message(&k, role, serde_json::json!(format!("message {i}")))
                .unwrap();
        }

        let session = manager
            .get_session(&ChannelId::new("cli"), &ChatId::from("c2"), &UserId::from("u1"), false)
            .unwrap()
            .unwrap();
        // with max_history default (200) no truncation should have happened yet
        assert_eq!(session.context.messages.len(), 10);
    }

    #[test]
    fn save_if_dirty_writes_and_clears_flag() {
        let (_dir, manager) = new_manager();
        manager.get_session(&ChannelId::new("cli"), &ChatId::from("c3"), &UserId::from("u1"), true).unwrap();
        assert!(manager.save_if_dirty().unwrap());
        assert!(!manager.save_if_dirty().unwrap());
    }

    #[test]
    fn cleanup_evicts_expired_sessions() {
        let (_dir, manager) = new_manager();
        let channel = ChannelId::new("cli");
        let chat = ChatId::from("c4");
        let user = UserId::from("u1");
        let mut session = manager.get_session(&channel, &chat, &user, true).unwrap().unwrap();
        session.last_active = (chrono::Utc::now() - chrono::Duration::hours(5)).to_rfc3339();
        manager.sessions.lock().unwrap().insert(session.key.as_str().to_string(), session);

        let evicted = manager.cleanup();
        assert_eq!(evicted, 1);
        assert_eq!(manager.len(), 0);
    }
}
