use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {key}")]
    NotFound { key: String },

    #[error("core error: {0}")]
    Core(#[from] conduit_core::CoreError),

    #[error("invalid session key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
