//! Data model for the optional Master-Worker orchestrator (spec §4.9),
//! used only in multi-process deployments that scale the agent core
//! across nodes.

use serde::{Deserialize, Serialize};

use conduit_core::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Master,
    Worker,
    Specialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Dead,
    Stopping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub agent_type: AgentType,
    pub process_id: u32,
    pub status: AgentStatus,
    pub capabilities: Vec<String>,
    pub current_task: Option<String>,
    pub current_task_desc: Option<String>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
}

impl AgentInfo {
    pub fn new_worker(agent_id: AgentId, process_id: u32, capabilities: Vec<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            agent_id,
            agent_type: AgentType::Worker,
            process_id,
            status: AgentStatus::Idle,
            capabilities,
            current_task: None,
            current_task_desc: None,
            tasks_completed: 0,
            tasks_failed: 0,
            created_at: now,
            last_heartbeat: now,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.status, AgentStatus::Idle)
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}

/// Envelope type for every message on the `AgentBus`, whether it travels
/// over the ROUTER/DEALER command socket or the PUB/SUB broadcast socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub msg_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub sender_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<AgentId>,
    #[serde(rename = "type")]
    pub msg_type: BusMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_type: Option<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusMessageType {
    Command,
    Response,
    Heartbeat,
    Event,
}

impl BusEnvelope {
    pub fn command(sender: AgentId, target: AgentId, command_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            sender_id: sender,
            target_id: Some(target),
            msg_type: BusMessageType::Command,
            command_type: Some(command_type.into()),
            payload,
        }
    }

    pub fn heartbeat(sender: AgentId) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            sender_id: sender,
            target_id: None,
            msg_type: BusMessageType::Heartbeat,
            command_type: None,
            payload: serde_json::Value::Null,
        }
    }
}
