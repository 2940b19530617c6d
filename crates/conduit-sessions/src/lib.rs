pub mod error;
pub mod manager;
pub mod types;

pub use error::SessionError;
pub use manager::{run_cleanup_loop, run_save_loop, SessionManager};
pub use types::{HistoryMessage, Session, SessionConfig, SessionContext, SessionKey, SessionState, SessionStore};
