//! Long-term memory as an external collaborator (spec §1): this crate
//! specifies only `add`/`forget`/`search`/`stats` against a per-user store.
//! Fact extraction (deciding *what* to remember from a conversation),
//! embeddings, and vector retrieval are out of scope and live behind
//! whatever calls into `MemoryManager`.

pub mod db;
pub mod error;
pub mod manager;
pub mod types;

pub use error::MemoryError;
pub use manager::{MemoryManager, SqliteMemoryManager};
pub use types::{Memory, MemoryCategory, MemorySource, MemoryStats};
