//! Stdin/stdout adapter — the minimal `Channel` implementation needed to
//! exercise the gateway contract locally without a real chat backend
//! (spec §1's Non-goals exclude the per-channel wire protocols; only this
//! adapter and an HTTP-SSE one are in scope).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use conduit_channels::{Channel, ChannelError};
use conduit_core::{ChannelId, ChatId, UserId};
use conduit_protocol::{OutgoingMessage, UnifiedMessage};

pub const CLI_CHAT_ID: &str = "local";
pub const CLI_USER_ID: &str = "operator";

pub struct CliChannel {
    running: Arc<AtomicBool>,
    inbound: Option<mpsc::Sender<UnifiedMessage>>,
}

impl CliChannel {
    pub fn new() -> Self {
        Self { running: Arc::new(AtomicBool::new(false)), inbound: None }
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn channel_name(&self) -> &str {
        "cli"
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_inbound(&mut self, tx: mpsc::Sender<UnifiedMessage>) {
        self.inbound = Some(tx);
    }

    async fn start(&mut self) -> Result<(), ChannelError> {
        if self.is_running() {
            return Ok(());
        }
        let Some(inbound) = self.inbound.clone() else {
            return Err(ChannelError::ConfigError("set_inbound must be called before start".into()));
        };
        self.running.store(true, Ordering::Release);
        let running = self.running.clone();

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let mut lines = BufReader::new(stdin).lines();
            info!("cli channel reading from stdin, Ctrl-D to exit");
            while running.load(Ordering::Acquire) {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let msg = UnifiedMessage::text(
                            ChannelId::new("cli"),
                            uuid::Uuid::new_v4().to_string(),
                            ChatId::from(CLI_CHAT_ID),
                            UserId::from(CLI_USER_ID),
                            CLI_USER_ID,
                            line,
                        );
                        if inbound.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
            running.store(false, Ordering::Release);
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ChannelError> {
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    async fn send_message(&self, msg: &OutgoingMessage) -> Result<(), ChannelError> {
        self.send_text(msg.chat_id.as_str(), &msg.text, msg.reply_to.as_deref(), msg.thread_id.as_deref()).await
    }

    async fn send_text(
        &self,
        _chat_id: &str,
        text: &str,
        _reply_to: Option<&str>,
        _thread_id: Option<&str>,
    ) -> Result<(), ChannelError> {
        println!("{text}");
        Ok(())
    }

    async fn send_typing(&self, _chat_id: &str) -> Result<(), ChannelError> {
        Ok(())
    }
}
