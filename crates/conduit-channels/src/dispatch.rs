//! Message Gateway dispatch loop (spec §4.6): fan inbound adapter traffic
//! into one worker per session key, run pre/post-process hooks, hand each
//! turn to the agent handler, and send the reply back through the adapter
//! with reply-splitting and retry/backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use conduit_core::SessionKey;
use conduit_observability::{HookAction, HookContext, HookEngine, HookEvent};
use conduit_protocol::{OutgoingMessage, UnifiedMessage};

use crate::manager::ChannelManager;

const QUEUE_CAPACITY: usize = 256;
const SESSION_QUEUE_CAPACITY: usize = 64;
const TYPING_INTERVAL: Duration = Duration::from_secs(4);
const MAX_REPLY_CHARS: usize = 4000;
const SEND_RETRIES: u32 = 3;
const SEND_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// The one capability the gateway needs from whatever drives the agent
/// turn (Reasoning Engine, Agent Orchestrator, or a stub in tests).
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, session_key: &SessionKey, input_text: &str) -> String;
}

/// Per-session interrupt routing: while a task is `WAITING_USER`, an
/// incoming message for that session key is routed here instead of the
/// normal dispatch queue. Whatever implements the Reasoning Engine's
/// `InterruptSource` trait owns the receiving half.
#[derive(Default, Clone)]
pub struct InterruptRegistry {
    waiting: Arc<DashMap<String, mpsc::Sender<String>>>,
}

impl InterruptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin waiting for a reply on this session. Replaces any previous
    /// (stale) waiter for the same key.
    pub fn begin_wait(&self, session_key: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(1);
        self.waiting.insert(session_key.to_string(), tx);
        rx
    }

    pub fn end_wait(&self, session_key: &str) {
        self.waiting.remove(session_key);
    }

    /// Attempt to route `text` to an active waiter. Returns `true` if a
    /// waiter consumed it (the caller must not also enqueue it normally).
    pub async fn try_route(&self, session_key: &str, text: String) -> bool {
        let Some(tx) = self.waiting.get(session_key).map(|e| e.clone()) else {
            return false;
        };
        tx.send(text).await.is_ok()
    }
}

/// Runs pre/post-process hooks through the shared `HookEngine`, using
/// `MessageReceived`/`MessageSent` with JSON payload substitution, exactly
/// as `HookAction::Modify` is documented to work.
async fn run_pre_process(hooks: &HookEngine, message: UnifiedMessage) -> UnifiedMessage {
    let payload = serde_json::to_value(&message).unwrap_or(serde_json::json!({}));
    let mut ctx = HookContext::new(HookEvent::MessageReceived, payload);
    match hooks.emit_before(&mut ctx) {
        HookAction::Block { reason } => {
            warn!(reason, "pre-process hook blocked inbound message, passing through unmodified");
            message
        }
        _ => serde_json::from_value(ctx.payload).unwrap_or(message),
    }
}

async fn run_post_process(hooks: &HookEngine, reply: String) -> String {
    let mut ctx = HookContext::new(HookEvent::MessageSent, serde_json::json!({ "text": reply }));
    match hooks.emit_before(&mut ctx) {
        HookAction::Block { .. } => String::new(),
        _ => ctx
            .payload
            .get("text")
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .unwrap_or(reply),
    }
}

/// Split `text` into chunks of at most `MAX_REPLY_CHARS`, preferring to
/// break at a newline boundary near the limit.
fn split_reply(text: &str) -> Vec<String> {
    if text.chars().count() <= MAX_REPLY_CHARS {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    let mut parts = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + MAX_REPLY_CHARS).min(chars.len());
        let mut split_at = end;
        if end < chars.len() {
            if let Some(nl) = chars[start..end].iter().rposition(|&c| c == '\n') {
                if nl > 0 {
                    split_at = start + nl + 1;
                }
            }
        }
        parts.push(chars[start..split_at].iter().collect());
        start = split_at;
    }
    parts
}

async fn send_with_retry(
    channels: &ChannelManager,
    channel_name: &str,
    chat_id: &str,
    text: &str,
    reply_to: Option<&str>,
    thread_id: Option<&str>,
) -> bool {
    let Some(channel) = channels.get(channel_name) else {
        error!(channel = channel_name, "adapter not registered, cannot send reply");
        return false;
    };

    for attempt in 1..=SEND_RETRIES {
        match channel.send_text(chat_id, text, reply_to, thread_id).await {
            Ok(()) => return true,
            Err(e) if attempt == SEND_RETRIES => {
                error!(channel = channel_name, error = %e, "send failed after all retries");
            }
            Err(e) => {
                warn!(channel = channel_name, attempt, error = %e, "send failed, retrying");
                tokio::time::sleep(SEND_RETRY_BACKOFF).await;
            }
        }
    }
    false
}

async fn send_reply(
    channels: &ChannelManager,
    channel_name: &str,
    chat_id: &str,
    reply_to: Option<&str>,
    thread_id: Option<&str>,
    reply: &str,
) {
    let parts = split_reply(reply);
    let mut all_ok = true;
    for (i, part) in parts.iter().enumerate() {
        let this_reply_to = if i == 0 { reply_to } else { None };
        if !send_with_retry(channels, channel_name, chat_id, part, this_reply_to, thread_id).await {
            all_ok = false;
        }
    }
    if !all_ok {
        let _ = send_with_retry(channels, channel_name, chat_id, "发送失败，请稍后重试。", None, thread_id).await;
    }
}

/// Background typing-indicator loop: fires `send_typing` every 4s until
/// the returned handle is dropped/aborted.
fn spawn_typing_loop(channels: Arc<ChannelManager>, channel_name: String, chat_id: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TYPING_INTERVAL);
        loop {
            ticker.tick().await;
            if let Some(channel) = channels.get(&channel_name) {
                if let Err(e) = channel.send_typing(&chat_id).await {
                    debug!(channel = %channel_name, error = %e, "typing indicator failed");
                }
            }
        }
    })
}

/// Owns the bounded inbound queue, the per-session worker map, and the
/// shared handler/hook references every worker consults.
pub struct Gateway {
    channels: Arc<ChannelManager>,
    hooks: Arc<HookEngine>,
    handler: Arc<dyn AgentHandler>,
    pub interrupts: InterruptRegistry,
    session_workers: Mutex<HashMap<String, mpsc::Sender<UnifiedMessage>>>,
}

impl Gateway {
    pub fn new(channels: Arc<ChannelManager>, hooks: Arc<HookEngine>, handler: Arc<dyn AgentHandler>) -> Self {
        Self {
            channels,
            hooks,
            handler,
            interrupts: InterruptRegistry::new(),
            session_workers: Mutex::new(HashMap::new()),
        }
    }

    /// Entry point fed by every adapter's inbound sender. Routes interrupt
    /// replies to a waiting task; otherwise dispatches to the owning
    /// session's worker, spawning one if this is the first message for
    /// that key.
    pub async fn submit(self: &Arc<Self>, message: UnifiedMessage) {
        let key = SessionKey::new(
            &message.channel,
            &message.chat_id,
            &message.user_id,
        )
        .to_string();

        if self.interrupts.try_route(&key, message.plain_text.clone()).await {
            debug!(session_key = %key, "routed inbound message to waiting interrupt queue");
            return;
        }

        let sender = {
            let mut workers = self.session_workers.lock().await;
            if let Some(tx) = workers.get(&key) {
                tx.clone()
            } else {
                let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
                workers.insert(key.clone(), tx.clone());
                let gateway = Arc::clone(self);
                let worker_key = key.clone();
                tokio::spawn(async move {
                    gateway.run_session_worker(worker_key, rx).await;
                });
                tx
            }
        };

        if sender.send(message).await.is_err() {
            error!(session_key = %key, "session worker channel closed unexpectedly");
        }
    }

    /// Strictly sequential per-session turn processing: typing loop, hooks,
    /// session append (left to the caller-supplied handler), agent call,
    /// post-process, reply delivery.
    async fn run_session_worker(self: Arc<Self>, session_key: String, mut rx: mpsc::Receiver<UnifiedMessage>) {
        while let Some(message) = rx.recv().await {
            let channel_name = message.channel.to_string();
            let chat_id = message.chat_id.to_string();
            let typing = spawn_typing_loop(Arc::clone(&self.channels), channel_name.clone(), chat_id.clone());

            let processed = run_pre_process(&self.hooks, message).await;
            let key = SessionKey::new(&processed.channel, &processed.chat_id, &processed.user_id);

            let reply = self.handler.handle(&key, &processed.plain_text).await;
            let reply = run_post_process(&self.hooks, reply).await;

            typing.abort();

            if !reply.is_empty() {
                send_reply(
                    &self.channels,
                    &channel_name,
                    &chat_id,
                    Some(&processed.channel_message_id),
                    processed.thread_id.as_deref(),
                    &reply,
                )
                .await;
            }
        }
        info!(session_key = %session_key, "session worker drained, exiting");
    }

    /// Deliver `text` to every session matching the given channel/user
    /// filters (both `None` means every known channel currently registered).
    pub async fn broadcast(&self, text: &str, channels: Option<&[String]>, chat_ids: Option<&[(String, String)]>) {
        let targets: Vec<(String, bool)> = self.channels.statuses();
        for (name, running) in targets {
            if !running {
                continue;
            }
            if let Some(allow) = channels {
                if !allow.contains(&name) {
                    continue;
                }
            }
            if let Some(chats) = chat_ids {
                for (ch, chat_id) in chats.iter().filter(|(ch, _)| ch == &name) {
                    let _ = ch;
                    send_reply(&self.channels, &name, chat_id, None, None, text).await;
                }
            } else {
                debug!(channel = %name, "broadcast requested with no chat_id filter, skipping (no addressable target)");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::error::ChannelError;
    use conduit_core::{ChannelId, ChatId, UserId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AgentHandler for EchoHandler {
        async fn handle(&self, _session_key: &SessionKey, input: &str) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            format!("echo: {input}")
        }
    }

    struct RecordingChannel {
        name: String,
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn channel_name(&self) -> &str {
            &self.name
        }
        fn is_running(&self) -> bool {
            true
        }
        fn set_inbound(&mut self, _tx: mpsc::Sender<UnifiedMessage>) {}
        async fn start(&mut self) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn stop(&mut self) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn send_message(&self, _msg: &OutgoingMessage) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn send_text(
            &self,
            _chat_id: &str,
            text: &str,
            _reply_to: Option<&str>,
            _thread_id: Option<&str>,
        ) -> Result<(), ChannelError> {
            self.sent.lock().await.push(text.to_string());
            Ok(())
        }
        async fn send_typing(&self, _chat_id: &str) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    fn sample_message(channel: &str) -> UnifiedMessage {
        UnifiedMessage::text(
            ChannelId::from(channel),
            "cm1",
            ChatId::from("chat1"),
            UserId::new(),
            "u1",
            "hello",
        )
    }

    #[tokio::test]
    async fn submits_message_and_delivers_reply() {
        let mut manager = ChannelManager::new();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (tx, _rx) = mpsc::channel(1);
        manager.register(
            Box::new(RecordingChannel { name: "cli".into(), sent: sent.clone() }),
            tx,
        );
        let channels = Arc::new(manager);
        let hooks = Arc::new(HookEngine::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(EchoHandler { calls: calls.clone() });
        let gateway = Arc::new(Gateway::new(channels, hooks, handler));

        gateway.submit(sample_message("cli")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let sent = sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], "echo: hello");
    }

    #[test]
    fn splits_long_reply_at_newline_boundary() {
        let mut text = String::new();
        for i in 0..100 {
            text.push_str(&format!("line {i}\n"));
        }
        let parts = split_reply(&text);
        assert!(parts.len() > 1);
        for part in &parts {
            assert!(part.chars().count() <= MAX_REPLY_CHARS);
        }
        assert_eq!(parts.join(""), text);
    }

    #[tokio::test]
    async fn interrupt_registry_routes_reply_away_from_normal_queue() {
        let registry = InterruptRegistry::new();
        let mut rx = registry.begin_wait("session-1");
        let routed = registry.try_route("session-1", "the answer".to_string()).await;
        assert!(routed);
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply, "the answer");
    }

    #[tokio::test]
    async fn interrupt_registry_does_not_route_without_a_waiter() {
        let registry = InterruptRegistry::new();
        let routed = registry.try_route("session-2", "stray".to_string()).await;
        assert!(!routed);
    }
}
