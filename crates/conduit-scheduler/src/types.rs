use serde::{Deserialize, Serialize};

/// Defines when and how often a task should run.
///
/// Weekday numbering in cron fields follows the target-language convention
/// (`Monday = 0`) even though the wire-format cron string itself uses the
/// POSIX convention (`Sunday = 0`) — conversion happens in `next_run_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Fires once at a single future UTC instant.
    Once { at: chrono::DateTime<chrono::Utc> },

    /// Fires on a fixed interval, optionally anchored to a start time.
    Interval {
        minutes: Option<u32>,
        hours: Option<u32>,
        days: Option<u32>,
        start_time: Option<chrono::DateTime<chrono::Utc>>,
    },

    /// Five-field cron expression: `m h dom mon dow`.
    Cron { expression: String },
}

/// Spec §3 data-model status set. `Scheduled` is the steady "waiting for
/// `next_run`" state a recurring task sits in between runs; `Pending` is
/// reserved for a task that has not yet had a `next_run` computed.
/// `fail_count >= 5` self-quarantines into `Failed` (not a separate
/// "quarantined" status — the spec names no such variant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Disabled,
    Cancelled,
}

/// Spec §3: `task_type ∈ {reminder, task}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Reminder,
    Task,
}

/// A scheduled task as persisted to `tasks.json`. Field set follows spec §3
/// (`ScheduledTask`) and the §6 "Scheduler task serialization" key list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger: Trigger,
    pub task_type: TaskType,
    pub reminder_message: Option<String>,
    pub prompt: Option<String>,
    pub script_path: Option<String>,
    /// Opaque JSON payload forwarded to the dispatched handler — the core's
    /// stand-in for the skills layer's richer `task_type=task` execution
    /// (invoking the agent, running a script), which is an external
    /// collaborator concern per spec §1/§9.
    pub action: serde_json::Value,
    pub channel_id: Option<String>,
    pub chat_id: Option<String>,
    pub user_id: Option<String>,
    pub status: TaskStatus,
    pub enabled: bool,
    /// System tasks (`deletable=false`) can be disabled but never deleted
    /// (spec §3 invariant).
    pub deletable: bool,
    pub last_run: Option<String>,
    pub next_run: Option<chrono::DateTime<chrono::Utc>>,
    pub run_count: u32,
    pub fail_count: u32,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default = "default_metadata")]
    pub metadata: serde_json::Value,
}

fn default_metadata() -> serde_json::Value {
    serde_json::json!({})
}

impl ScheduledTask {
    pub fn new(id: String, name: String, trigger: Trigger, task_type: TaskType, action: serde_json::Value) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id,
            name,
            description: String::new(),
            trigger,
            task_type,
            reminder_message: None,
            prompt: None,
            script_path: None,
            action,
            channel_id: None,
            chat_id: None,
            user_id: None,
            status: TaskStatus::Pending,
            enabled: true,
            deletable: true,
            last_run: None,
            next_run: None,
            run_count: 0,
            fail_count: 0,
            created_at: now.clone(),
            updated_at: now,
            metadata: default_metadata(),
        }
    }

    pub fn is_once(&self) -> bool {
        matches!(self.trigger, Trigger::Once { .. })
    }
}

/// A single recorded execution, kept for observability (bounded to the most
/// recent 1,000 entries in `executions.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskStore {
    pub tasks: std::collections::HashMap<String, ScheduledTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionStore {
    pub executions: Vec<TaskExecution>,
}
