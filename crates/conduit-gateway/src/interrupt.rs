//! Per-session interrupt queue: inbound messages that arrive while a task
//! is suspended in `WAITING_USER` are routed here instead of re-entering
//! the agent, and the Reasoning Engine's `ask_user` wait polls them back
//! out (spec §4.4.2, §4.6).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use conduit_agent::InterruptSource;
use conduit_channels::ChannelManager;

/// One pending reply slot per session key. A `Mutex<Vec<String>>` rather
/// than an `mpsc` channel because a session can only have one outstanding
/// `ask_user` at a time, but replies may arrive before the engine starts
/// polling (the gateway enqueues them as soon as they're dispatched).
#[derive(Default)]
pub struct InterruptQueues {
    queues: DashMap<String, Arc<Mutex<Vec<String>>>>,
}

impl InterruptQueues {
    pub fn new() -> Self {
        Self { queues: DashMap::new() }
    }

    fn queue_for(&self, session_key: &str) -> Arc<Mutex<Vec<String>>> {
        self.queues
            .entry(session_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    /// Push an incoming message's text onto a session's interrupt queue.
    /// Called by the dispatch loop when a message arrives for a session
    /// whose prior turn is still `WAITING_USER`.
    pub async fn push(&self, session_key: &str, text: String) {
        let queue = self.queue_for(session_key);
        queue.lock().await.push(text);
    }

    async fn pop(&self, session_key: &str) -> Option<String> {
        let queue = self.queue_for(session_key);
        let mut guard = queue.lock().await;
        if guard.is_empty() {
            None
        } else {
            Some(guard.remove(0))
        }
    }

    pub fn clear(&self, session_key: &str) {
        self.queues.remove(session_key);
    }
}

/// Bridges the engine's `InterruptSource` trait to the gateway's adapter
/// registry and interrupt queues: sends the question/reminder through the
/// channel the session arrived on, and polls the queue with a 2s tick
/// (spec §5 suspension points) up to the caller-supplied timeout.
pub struct GatewayInterrupts {
    pub channels: Arc<ChannelManager>,
    pub queues: Arc<InterruptQueues>,
}

const POLL_TICK: Duration = Duration::from_millis(2000);

#[async_trait]
impl InterruptSource for GatewayInterrupts {
    async fn send_question(&self, session_key: &str, question: &str) {
        self.send_to_session(session_key, question).await;
    }

    async fn send_reminder(&self, session_key: &str) {
        self.send_to_session(
            session_key,
            "（提醒）我仍在等待您的回复，请问您想如何处理？",
        )
        .await;
    }

    async fn poll_reply(&self, session_key: &str, wait: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(reply) = self.queues.pop(session_key).await {
                debug!(session_key, "interrupt queue delivered reply");
                return Some(reply);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let step = POLL_TICK.min(deadline - now);
            tokio::time::sleep(step).await;
        }
    }
}

impl GatewayInterrupts {
    async fn send_to_session(&self, session_key: &str, text: &str) {
        let Some((channel, chat_id, _user_id)) =
            conduit_core::SessionKey(session_key.to_string()).parse()
        else {
            return;
        };
        if let Some(adapter) = self.channels.get(channel.as_str()) {
            let _ = adapter.send_text(chat_id.as_str(), text, None, None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_pop_returns_fifo() {
        let q = InterruptQueues::new();
        q.push("telegram:1:2", "first".into()).await;
        q.push("telegram:1:2", "second".into()).await;
        assert_eq!(q.pop("telegram:1:2").await, Some("first".to_string()));
        assert_eq!(q.pop("telegram:1:2").await, Some("second".to_string()));
        assert_eq!(q.pop("telegram:1:2").await, None);
    }

    #[tokio::test]
    async fn poll_reply_picks_up_pushed_value_within_timeout() {
        let queues = Arc::new(InterruptQueues::new());
        let queues2 = queues.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            queues2.push("cli:1:1", "csv".into()).await;
        });
        let interrupts = GatewayInterrupts {
            channels: Arc::new(ChannelManager::new()),
            queues,
        };
        let reply = interrupts.poll_reply("cli:1:1", Duration::from_secs(2)).await;
        assert_eq!(reply, Some("csv".to_string()));
    }
}
