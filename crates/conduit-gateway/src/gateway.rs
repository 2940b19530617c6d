//! Message Gateway (spec §4.6): fans channel adapters into a single queue,
//! dispatches one worker per session key so per-session ordering holds
//! while different chats process in parallel, and drives the per-message
//! pipeline (typing indicator, hooks, agent call, split-and-send-with-retry).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use conduit_channels::ChannelManager;
use conduit_core::{ChatId, SessionKey};
use conduit_protocol::UnifiedMessage;
use conduit_sessions::{Session, SessionManager};

use crate::error::{GatewayError, Result};
use crate::hooks::{PostProcessHook, PreProcessHook};
use crate::interrupt::InterruptQueues;

const TYPING_INTERVAL: Duration = Duration::from_secs(4);
const MAX_REPLY_CHARS: usize = 4000;
const SEND_RETRIES: u32 = 3;
const SEND_BACKOFF: Duration = Duration::from_secs(1);
const SESSION_QUEUE_CAPACITY: usize = 256;

/// `(Session, input_text) -> response_text`, as spec §4.6 describes the
/// agent entrypoint the gateway calls after session fetch/append.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, session: Session, input_text: String) -> String;
}

/// Marker metadata keys the engine reaches back through (spec §9: "the
/// engine reaches back to the gateway via `session.metadata["_gateway"]`").
/// These are transient and stripped before persistence by the session layer.
pub const META_GATEWAY: &str = "_gateway";
pub const META_SESSION_KEY: &str = "_session_key";

pub struct MessageGateway {
    channels: Arc<ChannelManager>,
    sessions: Arc<SessionManager>,
    agent: Arc<dyn AgentHandler>,
    pub interrupts: Arc<InterruptQueues>,
    pre_hooks: Vec<Arc<dyn PreProcessHook>>,
    post_hooks: Vec<Arc<dyn PostProcessHook>>,
    /// One bounded mpsc sender per session key, lazily created, feeding that
    /// session's dedicated worker task.
    workers: DashMap<String, mpsc::Sender<UnifiedMessage>>,
    /// Tasks currently in `WAITING_USER`, tracked so a subsequent message
    /// for that session is routed to the interrupt queue instead of
    /// starting a fresh agent call.
    waiting: DashMap<String, ()>,
}

impl MessageGateway {
    /// `interrupts` must be the same queue handed to whatever `InterruptSource`
    /// the Reasoning Engine uses (typically `GatewayInterrupts`), so that a
    /// reply dispatched here while a session is `WAITING_USER` is visible to
    /// the engine's `ask_user` poll.
    pub fn new(
        channels: Arc<ChannelManager>,
        sessions: Arc<SessionManager>,
        agent: Arc<dyn AgentHandler>,
        interrupts: Arc<InterruptQueues>,
    ) -> Self {
        Self {
            channels,
            sessions,
            agent,
            interrupts,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
            workers: DashMap::new(),
            waiting: DashMap::new(),
        }
    }

    pub fn add_pre_hook(&mut self, hook: Arc<dyn PreProcessHook>) {
        self.pre_hooks.push(hook);
    }

    pub fn add_post_hook(&mut self, hook: Arc<dyn PostProcessHook>) {
        self.post_hooks.push(hook);
    }

    /// Mark a session's turn as suspended in `WAITING_USER`: the next
    /// inbound message for this key is routed to the interrupt queue
    /// instead of re-entering the agent.
    pub fn mark_waiting(&self, session_key: &str) {
        self.waiting.insert(session_key.to_string(), ());
    }

    pub fn clear_waiting(&self, session_key: &str) {
        self.waiting.remove(session_key);
        self.interrupts.clear(session_key);
    }

    /// Entry point called by adapters (directly, or via a shared queue
    /// drained by the caller) for every inbound `UnifiedMessage`. Routes to
    /// the interrupt queue if the session is waiting on the user, otherwise
    /// to that session's dedicated worker (spawned lazily).
    pub async fn dispatch(self: &Arc<Self>, message: UnifiedMessage) -> Result<()> {
        let key = SessionKey::new(&message.channel, &message.chat_id, &message.user_id)
            .as_str()
            .to_string();

        if self.waiting.contains_key(&key) {
            self.interrupts.push(&key, message.plain_text.clone()).await;
            return Ok(());
        }

        let sender = self.worker_sender(key.clone());
        sender.send(message).await.map_err(|_| GatewayError::QueueFull)
    }

    fn worker_sender(self: &Arc<Self>, key: String) -> mpsc::Sender<UnifiedMessage> {
        if let Some(existing) = self.workers.get(&key) {
            return existing.clone();
        }
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        self.workers.insert(key.clone(), tx.clone());
        let gateway = self.clone();
        tokio::spawn(async move {
            gateway.session_worker(key, rx).await;
        });
        tx
    }

    /// Strictly sequential per-session worker: processes one message at a
    /// time for this session key, guaranteeing in-order delivery while
    /// other sessions' workers run concurrently.
    async fn session_worker(self: Arc<Self>, key: String, mut rx: mpsc::Receiver<UnifiedMessage>) {
        while let Some(message) = rx.recv().await {
            if let Err(e) = self.process_message(&key, message).await {
                warn!(session_key = %key, error = %e, "message pipeline failed");
            }
        }
    }

    async fn process_message(self: &Arc<Self>, key: &str, message: UnifiedMessage) -> Result<()> {
        let channel_name = message.channel.as_str().to_string();
        let chat_id = message.chat_id.clone();
        let reply_to = message.channel_message_id.clone();

        let typing_handle = self.spawn_typing(channel_name.clone(), chat_id.clone());

        let mut message = message;
        for hook in &self.pre_hooks {
            message = hook.run(message).await;
        }

        let session = self
            .sessions
            .get_session(&message.channel, &message.chat_id, &message.user_id, true)?
            .expect("create_if_missing=true always yields a session");

        self.sessions.add_message(
            &SessionKey(key.to_string()),
            "user",
            serde_json::json!({ "text": message.plain_text }),
        )?;

        let reply_text = self.agent.handle(session, message.plain_text.clone()).await;

        let mut reply_text = reply_text;
        for hook in &self.post_hooks {
            reply_text = hook.run(reply_text).await;
        }

        self.sessions.add_message(
            &SessionKey(key.to_string()),
            "assistant",
            serde_json::json!({ "text": reply_text }),
        )?;

        typing_handle.abort();

        self.send_reply(&channel_name, &chat_id, &reply_text, Some(&reply_to))
            .await;

        Ok(())
    }

    fn spawn_typing(&self, channel_name: String, chat_id: ChatId) -> tokio::task::JoinHandle<()> {
        let channels = self.channels.clone();
        tokio::spawn(async move {
            let mut ticker = interval(TYPING_INTERVAL);
            loop {
                ticker.tick().await;
                if let Some(adapter) = channels.get(&channel_name) {
                    let _ = adapter.send_typing(chat_id.as_str()).await;
                }
            }
        })
    }

    /// Split a reply over 4000 chars at newline boundaries, send each part
    /// with up to 3 retries and 1s backoff; only the first part carries
    /// `reply_to`. On final failure, attempt a plain apology.
    async fn send_reply(
        &self,
        channel_name: &str,
        chat_id: &ChatId,
        text: &str,
        reply_to: Option<&str>,
    ) {
        let Some(adapter) = self.channels.get(channel_name) else {
            warn!(channel = channel_name, "no adapter registered, dropping reply");
            return;
        };

        let parts = split_at_newlines(text, MAX_REPLY_CHARS);
        for (i, part) in parts.iter().enumerate() {
            let this_reply_to = if i == 0 { reply_to } else { None };
            let mut sent = false;
            for attempt in 1..=SEND_RETRIES {
                match adapter.send_text(chat_id.as_str(), part, this_reply_to, None).await {
                    Ok(()) => {
                        sent = true;
                        break;
                    }
                    Err(e) => {
                        warn!(channel = channel_name, attempt, error = %e, "send failed, retrying");
                        tokio::time::sleep(SEND_BACKOFF).await;
                    }
                }
            }
            if !sent {
                let _ = adapter
                    .send_text(chat_id.as_str(), "发送失败，请稍后再试。", None, None)
                    .await;
                return;
            }
        }
    }

    /// `broadcast(text, channels?, user_ids?)`: iterate known sessions,
    /// filtering by channel/user, and send the text to each match.
    pub async fn broadcast(
        &self,
        text: &str,
        channels: Option<&[String]>,
        user_ids: Option<&[String]>,
    ) {
        for session in self.sessions.all_sessions() {
            let Some((channel, chat_id, user_id)) = session.key.parse() else {
                warn!(key = %session.key.as_str(), "broadcast: malformed session key, skipping");
                continue;
            };
            let channel_name = channel.to_string();

            if let Some(allow) = channels {
                if !allow.iter().any(|c| c == &channel_name) {
                    continue;
                }
            }
            if let Some(allow) = user_ids {
                if !allow.iter().any(|u| u == user_id.as_str()) {
                    continue;
                }
            }

            let Some(adapter) = self.channels.get(&channel_name) else {
                warn!(channel = %channel_name, "broadcast: no adapter registered for session's channel");
                continue;
            };

            match adapter.send_text(chat_id.as_str(), text, None, None).await {
                Ok(()) => info!(channel = %channel_name, chat_id = %chat_id.as_str(), "broadcast sent"),
                Err(e) => warn!(channel = %channel_name, chat_id = %chat_id.as_str(), error = %e, "broadcast send failed"),
            }
        }
    }
}

/// Split `text` into chunks of at most `max_chars`, preferring to break at
/// `\n` boundaries so paragraphs stay intact.
fn split_at_newlines(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if current.chars().count() + line.chars().count() > max_chars && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        while current.chars().count() > max_chars {
            let cut: String = current.chars().take(max_chars).collect();
            parts.push(cut.clone());
            current = current.chars().skip(cut.chars().count()).collect();
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_keeps_short_text_whole() {
        let parts = split_at_newlines("hello", 4000);
        assert_eq!(parts, vec!["hello".to_string()]);
    }

    #[test]
    fn split_breaks_long_text_at_newlines() {
        let text = format!("{}\n{}", "a".repeat(3000), "b".repeat(3000));
        let parts = split_at_newlines(&text, 4000);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].len() <= 4000);
        assert!(parts[1].len() <= 4000);
    }

    #[test]
    fn split_hard_breaks_a_single_oversized_line() {
        let text = "x".repeat(9000);
        let parts = split_at_newlines(&text, 4000);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].chars().count(), 4000);
    }
}
