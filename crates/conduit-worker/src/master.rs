//! `MasterAgent`: owns the bus and registry, owns `min_workers..max_workers`
//! worker child processes, and routes inbound requests to either local
//! handling or an idle worker (spec §4.9).

use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{info, warn};

use conduit_core::AgentId;

use crate::bus::MasterBus;
use crate::error::{Result, WorkerError};
use crate::registry::AgentRegistry;
use crate::types::{AgentStatus, BusEnvelope, BusMessageType};

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(120);

/// A request is handled locally (no workers running, or the message is
/// short with no prior history) rather than dispatched to a worker
/// process. Mirrors the spec's "decide local vs distributed" step.
pub fn should_handle_locally(registry: &AgentRegistry, message_len: usize, has_history: bool) -> bool {
    registry.is_empty() || (message_len < 200 && !has_history)
}

pub struct MasterAgent {
    pub registry: Arc<AgentRegistry>,
    bus: Arc<MasterBus>,
    worker_binary: String,
    min_workers: usize,
    max_workers: usize,
    children: DashMap<String, Child>,
    /// Pending command correlation ids awaiting a `response` envelope.
    pending: DashMap<String, oneshot::Sender<serde_json::Value>>,
}

impl MasterAgent {
    pub fn new(
        worker_binary: impl Into<String>,
        min_workers: usize,
        max_workers: usize,
        command_endpoint: &str,
        event_endpoint: &str,
    ) -> Result<Self> {
        let bus = Arc::new(MasterBus::bind(command_endpoint, event_endpoint)?);
        Ok(Self {
            registry: Arc::new(AgentRegistry::new()),
            bus,
            worker_binary: worker_binary.into(),
            min_workers,
            max_workers,
            children: DashMap::new(),
            pending: DashMap::new(),
        })
    }

    /// Ensure at least `min_workers` child processes are running.
    pub fn ensure_min_workers(&self) {
        let running = self.children.len();
        for i in running..self.min_workers {
            self.spawn_worker(&format!("worker-{i}"));
        }
    }

    fn spawn_worker(&self, agent_id: &str) {
        if self.children.len() >= self.max_workers {
            warn!(max_workers = self.max_workers, "at worker process cap, not spawning");
            return;
        }
        match Command::new(&self.worker_binary).arg("--agent-id").arg(agent_id).spawn() {
            Ok(child) => {
                info!(agent_id, pid = child.id(), "spawned worker process");
                self.children.insert(agent_id.to_string(), child);
            }
            Err(e) => warn!(agent_id, error = %e, "failed to spawn worker process"),
        }
    }

    pub fn terminate_worker(&self, agent_id: &AgentId) {
        if let Some((_, mut child)) = self.children.remove(agent_id.as_str()) {
            let _ = child.kill();
            self.registry.deregister(agent_id);
        }
    }

    /// Dispatch a request, either to the best idle worker or fail with
    /// `NoIdleAgent` (caller falls back to local handling).
    pub async fn dispatch(
        &self,
        required_caps: &[String],
        task_id: &str,
        task_desc: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let agent_id = self
            .registry
            .find_idle_agent(required_caps, None)
            .ok_or_else(|| WorkerError::NoIdleAgent(required_caps.to_vec()))?;

        self.registry.assign_task(&agent_id, task_id, task_desc);

        let envelope = BusEnvelope::command(AgentId::master(), agent_id.clone(), "run_task", payload);
        let correlation_id = envelope.msg_id.clone();

        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx);

        let identity = agent_id.as_str().as_bytes().to_vec();
        if let Err(e) = self.bus.send_to(identity, &envelope).await {
            self.pending.remove(&correlation_id);
            self.registry.complete_task(&agent_id, true);
            return Err(e);
        }

        match tokio::time::timeout(DISPATCH_TIMEOUT, rx).await {
            Ok(Ok(response)) => {
                self.registry.complete_task(&agent_id, false);
                Ok(response)
            }
            _ => {
                self.pending.remove(&correlation_id);
                self.registry.complete_task(&agent_id, true);
                self.reassign_after_timeout(&agent_id, task_id, task_desc);
                Err(WorkerError::Bus(format!("worker {agent_id} timed out")))
            }
        }
    }

    /// Resolve a pending dispatch when the ROUTER recv loop delivers a
    /// `response` envelope back from a worker.
    pub fn resolve_response(&self, envelope: BusEnvelope) {
        if envelope.msg_type != BusMessageType::Response {
            return;
        }
        if let Some(correlation_id) = &envelope.correlation_id {
            if let Some((_, tx)) = self.pending.remove(correlation_id) {
                let _ = tx.send(envelope.payload);
            }
        }
    }

    fn reassign_after_timeout(&self, timed_out: &AgentId, task_id: &str, task_desc: &str) {
        if let Some(replacement) = self.registry.find_idle_agent(&[], Some(timed_out)) {
            info!(from = %timed_out, to = %replacement, task_id, "reassigning timed-out task");
            self.registry.assign_task(&replacement, task_id, task_desc);
        } else {
            warn!(timed_out = %timed_out, task_id, "no idle agent to reassign timed-out task to");
        }
    }

    /// Heartbeat sweep: for every worker the registry just marked dead,
    /// re-queue its `current_task` (best-effort) and spawn a replacement
    /// if the pool has dropped below `min_workers`.
    pub fn handle_dead_workers(&self) {
        let dead = self.registry.check_heartbeats();
        for worker in dead {
            warn!(agent_id = %worker.agent_id, "worker missed heartbeat deadline, marking dead");
            if let Some(task_id) = &worker.current_task {
                warn!(agent_id = %worker.agent_id, task_id, "worker crashed, retry");
            }
            self.children.remove(worker.agent_id.as_str());
            if self.children.len() < self.min_workers {
                let replacement_id = format!("worker-{}", uuid::Uuid::new_v4());
                self.spawn_worker(&replacement_id);
            }
        }
    }

    pub fn set_agent_status(&self, agent_id: &AgentId, status: AgentStatus) {
        self.registry.set_status(agent_id, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_handle_locally_when_no_workers() {
        let registry = AgentRegistry::new();
        assert!(should_handle_locally(&registry, 500, true));
    }

    #[test]
    fn should_handle_locally_when_short_and_no_history() {
        let registry = AgentRegistry::new();
        registry.register(conduit_core_test_agent());
        assert!(should_handle_locally(&registry, 50, false));
        assert!(!should_handle_locally(&registry, 500, true));
    }

    fn conduit_core_test_agent() -> crate::types::AgentInfo {
        crate::types::AgentInfo::new_worker(AgentId::new("w1"), 1, vec![])
    }
}
