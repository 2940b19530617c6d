//! Optional Master-Worker orchestrator (spec §4.9) for multi-process
//! deployments that scale the agent core across nodes. Not used in the
//! single-process deployment; `conduit-orchestrator` only reaches into
//! this crate when a `MasterAgent` has been configured.

pub mod bus;
pub mod error;
pub mod master;
pub mod registry;
pub mod types;

pub use bus::{MasterBus, WorkerBus};
pub use error::{Result, WorkerError};
pub use master::{should_handle_locally, MasterAgent};
pub use registry::AgentRegistry;
pub use types::{AgentInfo, AgentStatus, AgentType, BusEnvelope, BusMessageType};
