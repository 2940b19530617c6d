pub mod engine;
pub mod error;
pub mod tracer;
pub mod types;

pub use engine::HookEngine;
pub use error::HookError;
pub use tracer::{SpanHandle, SpanType, Tracer, TraceRecord};
pub use types::{
    HookAction, HookContext, HookDefinition, HookEvent, HookHandler, HookResult, HookTiming,
};
