use async_trait::async_trait;
use tokio::sync::mpsc;

use conduit_protocol::{OutgoingMessage, UnifiedMessage};

use crate::error::ChannelError;

/// Common interface every channel adapter (Telegram/Feishu/WeCom/DingTalk/QQ/
/// OneBot/CLI/HTTP-SSE) must implement to be registered with the gateway.
///
/// `start`/`stop` must be idempotent: calling either twice in a row is not an
/// error. Inbound messages are delivered through the sender installed via
/// `set_inbound` rather than a boxed callback, since that is the idiomatic
/// shape for a `Send + Sync` trait object driven from multiple Tokio tasks.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable lowercase identifier for this channel (e.g. `"telegram"`).
    /// Must be unique across all adapters registered with one gateway.
    fn channel_name(&self) -> &str;

    /// Whether the adapter currently believes itself connected.
    fn is_running(&self) -> bool;

    /// Install the channel through which this adapter pushes every inbound
    /// `UnifiedMessage`. Equivalent to the adapter contract's
    /// `on_message(callback)`.
    fn set_inbound(&mut self, tx: mpsc::Sender<UnifiedMessage>);

    /// Establish the connection to the external service. Idempotent.
    async fn start(&mut self) -> Result<(), ChannelError>;

    /// Gracefully close the connection. Idempotent.
    async fn stop(&mut self) -> Result<(), ChannelError>;

    /// Deliver a full outgoing envelope (may include artifacts).
    async fn send_message(&self, msg: &OutgoingMessage) -> Result<(), ChannelError>;

    /// Deliver plain text, optionally threaded/replying to a prior message.
    async fn send_text(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<&str>,
        thread_id: Option<&str>,
    ) -> Result<(), ChannelError>;

    /// Signal to the remote chat that the bot is composing a reply.
    async fn send_typing(&self, chat_id: &str) -> Result<(), ChannelError>;
}
