//! Reasoning core: Context Manager, Response Handler, Tool Executor,
//! Reasoning Engine and the supporting `Brain`/`TaskState`/`ToolError`
//! types (spec §4.1-§4.4). Kept as a single crate — the three components
//! the expanded spec's crate table lists separately (`conduit-context`,
//! `conduit-tools`, `conduit-reasoning`) share one `TaskState`/`Brain`
//! vocabulary tightly enough that splitting them would only add
//! inter-crate plumbing; see DESIGN.md.

pub mod brain;
pub mod context;
pub mod engine;
pub mod executor;
pub mod monitor;
pub mod response;
pub mod task;
pub mod tool_error;

pub use brain::{Block, Brain, BrainError, ChatMessage, Decision, DecisionType, ModelInfo, Role, ToolCallRequest, ToolSpec};
pub use context::compress_if_needed;
pub use engine::{run, EngineDeps, EngineOutcome, InterruptSource, PlanContext, SessionType};
pub use executor::{PlanGateState, ToolExecutor, ToolHandler, ToolOutcome};
pub use monitor::{MonitorConfig, RetryDecision, TaskMonitor};
pub use response::{retrospect, sanitize_output, verify_completion, CompletionVerdict, PlanSnapshot, VerificationInput};
pub use task::{Checkpoint, ExecutedTool, IllegalTransition, SignatureRing, TaskState, TaskStatus};
pub use tool_error::{classify_error, ErrorKind, ToolError};
