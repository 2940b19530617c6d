use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("core error: {0}")]
    Core(#[from] conduit_core::CoreError),

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("task not found: {id}")]
    TaskNotFound { id: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
