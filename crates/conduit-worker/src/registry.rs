//! `AgentRegistry`: thread-safe map of `agent_id -> AgentInfo` plus the
//! heartbeat-timeout sweep that reclaims work from dead workers.

use dashmap::DashMap;

use conduit_core::AgentId;

use crate::types::{AgentInfo, AgentStatus};

const DEFAULT_HEARTBEAT_TIMEOUT_SECS: i64 = 15;

pub struct AgentRegistry {
    agents: DashMap<String, AgentInfo>,
    heartbeat_timeout_secs: i64,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self { agents: DashMap::new(), heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS }
    }

    pub fn with_heartbeat_timeout(mut self, secs: i64) -> Self {
        self.heartbeat_timeout_secs = secs;
        self
    }

    pub fn register(&self, info: AgentInfo) {
        self.agents.insert(info.agent_id.as_str().to_string(), info);
    }

    pub fn deregister(&self, agent_id: &AgentId) {
        self.agents.remove(agent_id.as_str());
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<AgentInfo> {
        self.agents.get(agent_id.as_str()).map(|e| e.clone())
    }

    pub fn heartbeat(&self, agent_id: &AgentId) {
        if let Some(mut entry) = self.agents.get_mut(agent_id.as_str()) {
            entry.last_heartbeat = chrono::Utc::now();
            if entry.status == AgentStatus::Dead {
                entry.status = AgentStatus::Idle;
            }
        }
    }

    pub fn set_status(&self, agent_id: &AgentId, status: AgentStatus) {
        if let Some(mut entry) = self.agents.get_mut(agent_id.as_str()) {
            entry.status = status;
        }
    }

    pub fn assign_task(&self, agent_id: &AgentId, task_id: &str, task_desc: &str) {
        if let Some(mut entry) = self.agents.get_mut(agent_id.as_str()) {
            entry.status = AgentStatus::Busy;
            entry.current_task = Some(task_id.to_string());
            entry.current_task_desc = Some(task_desc.to_string());
        }
    }

    pub fn complete_task(&self, agent_id: &AgentId, failed: bool) {
        if let Some(mut entry) = self.agents.get_mut(agent_id.as_str()) {
            entry.status = AgentStatus::Idle;
            entry.current_task = None;
            entry.current_task_desc = None;
            if failed {
                entry.tasks_failed += 1;
            } else {
                entry.tasks_completed += 1;
            }
        }
    }

    /// Idle candidate with the lowest `tasks_completed` (load balance),
    /// matching every entry in `required_caps` if given, excluding
    /// `exclude` (e.g. the worker that just failed this task).
    pub fn find_idle_agent(&self, required_caps: &[String], exclude: Option<&AgentId>) -> Option<AgentId> {
        self.agents
            .iter()
            .filter(|e| e.is_idle())
            .filter(|e| e.has_capabilities(required_caps))
            .filter(|e| exclude.map(|ex| ex.as_str() != e.key().as_str()).unwrap_or(true))
            .min_by_key(|e| e.tasks_completed)
            .map(|e| e.agent_id.clone())
    }

    /// Sweep every agent's `last_heartbeat`; any past `heartbeat_timeout`
    /// is marked `dead` and returned so the caller (MasterAgent) can
    /// re-queue its `current_task`.
    pub fn check_heartbeats(&self) -> Vec<AgentInfo> {
        let now = chrono::Utc::now();
        let mut dead = Vec::new();
        for mut entry in self.agents.iter_mut() {
            if entry.status == AgentStatus::Dead {
                continue;
            }
            let elapsed = now - entry.last_heartbeat;
            if elapsed.num_seconds() > self.heartbeat_timeout_secs {
                entry.status = AgentStatus::Dead;
                dead.push(entry.clone());
            }
        }
        dead
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn count_by_status(&self, status: AgentStatus) -> usize {
        self.agents.iter().filter(|e| e.status == status).count()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, completed: u64) -> AgentInfo {
        let mut a = AgentInfo::new_worker(AgentId::new(id), 100, vec!["browser".into()]);
        a.tasks_completed = completed;
        a
    }

    #[test]
    fn find_idle_agent_prefers_lowest_load() {
        let registry = AgentRegistry::new();
        registry.register(agent("w1", 5));
        registry.register(agent("w2", 1));
        registry.register(agent("w3", 10));
        let picked = registry.find_idle_agent(&["browser".to_string()], None).unwrap();
        assert_eq!(picked.as_str(), "w2");
    }

    #[test]
    fn find_idle_agent_respects_capability_filter() {
        let registry = AgentRegistry::new();
        let mut specialized = AgentInfo::new_worker(AgentId::new("w1"), 1, vec!["desktop".into()]);
        specialized.tasks_completed = 0;
        registry.register(specialized);
        let picked = registry.find_idle_agent(&["browser".to_string()], None);
        assert!(picked.is_none());
    }

    #[test]
    fn check_heartbeats_marks_stale_agents_dead() {
        let registry = AgentRegistry::new().with_heartbeat_timeout(0);
        let mut a = agent("w1", 0);
        a.last_heartbeat = chrono::Utc::now() - chrono::Duration::seconds(30);
        registry.register(a);
        let dead = registry.check_heartbeats();
        assert_eq!(dead.len(), 1);
        assert_eq!(registry.get(&AgentId::new("w1")).unwrap().status, AgentStatus::Dead);
    }
}
