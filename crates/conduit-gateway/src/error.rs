use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("channel error: {0}")]
    Channel(#[from] conduit_channels::ChannelError),

    #[error("session error: {0}")]
    Session(#[from] conduit_sessions::SessionError),

    #[error("message queue is full")]
    QueueFull,

    #[error("no adapter registered for channel {0}")]
    UnknownChannel(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
