pub mod message;
pub mod sse;

pub use message::{Artifact, ContentBlock, OutgoingMessage, UnifiedMessage};
pub use sse::SseEvent;
