use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("no idle agent available matching capabilities {0:?}")]
    NoIdleAgent(Vec<String>),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("bus transport error: {0}")]
    Bus(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
