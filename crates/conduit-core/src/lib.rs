pub mod atomic;
pub mod config;
pub mod error;
pub mod types;

pub use config::ConduitConfig;
pub use error::{CoreError, Result};
pub use types::{AgentId, ChannelId, ChatId, ConnId, SessionId, SessionKey, TaskId, UserId};
