use thiserror::Error;

/// Cross-cutting infrastructure errors shared by every crate in the
/// workspace. Component-specific taxonomies (`ToolError`, `SessionError`,
/// `SchedulerError`, ...) wrap or convert into this where they cross a
/// crate boundary into generic plumbing (config load, persistence I/O).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Short error code, used wherever an error needs to cross a wire
    /// boundary (SSE `error` events, scheduler execution records).
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::Serialization(_) => "SERIALIZATION_ERROR",
            CoreError::Io(_) => "IO_ERROR",
            CoreError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            CoreError::Timeout { .. } => "TIMEOUT",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
