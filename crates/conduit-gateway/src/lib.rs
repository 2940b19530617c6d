//! Message Gateway (spec §4.6): adapter fan-in, per-session dispatch,
//! typing indicator, pre/post hooks, interrupt queue for `ask_user`, and
//! split-and-send-with-retry delivery back to the originating adapter.

pub mod error;
pub mod gateway;
pub mod hooks;
pub mod interrupt;

pub use error::{GatewayError, Result};
pub use gateway::{AgentHandler, MessageGateway, META_GATEWAY, META_SESSION_KEY};
pub use hooks::{PostProcessHook, PreProcessHook};
pub use interrupt::{GatewayInterrupts, InterruptQueues};
