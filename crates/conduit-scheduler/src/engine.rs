use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use tokio::sync::Semaphore;
use tokio::time::interval;
use tracing::{error, info, warn};

use conduit_core::config::SchedulerConfig;

use crate::error::{Result, SchedulerError};
use crate::schedule::next_run_time;
use crate::types::{ExecutionStore, ScheduledTask, TaskExecution, TaskStatus, TaskStore, TaskType, Trigger};

const MAX_EXECUTIONS: usize = 1000;
/// Catch-up floor: on startup, a task whose `next_run` is missing or already
/// past is rescheduled no sooner than this, so a restart never bursts every
/// overdue interval/cron task at once.
const CATCHUP_MIN_SECS: i64 = 60;

/// A task handler receives the task's action payload and returns whether
/// the run succeeded.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &ScheduledTask) -> Result<()>;
}

/// Persists scheduled tasks and execution history, and drives the tick loop
/// that dispatches tasks whose trigger has come due.
pub struct SchedulerEngine {
    tasks: Mutex<HashMap<String, ScheduledTask>>,
    executions: Mutex<Vec<TaskExecution>>,
    tasks_path: std::path::PathBuf,
    executions_path: std::path::PathBuf,
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
}

impl SchedulerEngine {
    pub fn load(
        tasks_path: std::path::PathBuf,
        executions_path: std::path::PathBuf,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let task_store: TaskStore = conduit_core::atomic::read_json(&tasks_path)?;
        let execution_store: ExecutionStore = conduit_core::atomic::read_json(&executions_path)?;

        let mut tasks = task_store.tasks;
        apply_catchup_policy(&mut tasks);

        Ok(Self {
            tasks: Mutex::new(tasks),
            executions: Mutex::new(execution_store.executions),
            tasks_path,
            executions_path,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
        })
    }

    pub fn add_task(&self, name: &str, trigger: Trigger, action: serde_json::Value) -> Result<ScheduledTask> {
        let id = conduit_core::TaskId::new().as_str().to_string();
        let task = ScheduledTask::new(id, name.to_string(), trigger, TaskType::Task, action);
        self.create_task(task)
    }

    /// Insert a fully-built task (set any of `description`/`reminder_message`/
    /// `channel_id`/`chat_id`/`user_id`/`deletable`/`metadata` on it before
    /// calling this), computing `next_run` and persisting it.
    pub fn create_task(&self, mut task: ScheduledTask) -> Result<ScheduledTask> {
        task.next_run = next_run_time(&task.trigger, Utc::now())?;
        task.status = if task.next_run.is_some() { TaskStatus::Scheduled } else { TaskStatus::Pending };

        let mut tasks = self.tasks.lock().unwrap();
        tasks.insert(task.id.clone(), task.clone());
        drop(tasks);
        self.persist_tasks()?;
        info!(task = %task.name, "scheduled task added");
        Ok(task)
    }

    /// Spec §3 invariant: `deletable=false` (system) tasks can be disabled
    /// but never deleted — disable in place instead of removing them.
    pub fn remove_task(&self, id: &str) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let Some(task) = tasks.get_mut(id) else {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        };

        if !task.deletable {
            task.enabled = false;
            task.status = TaskStatus::Disabled;
            task.updated_at = Utc::now().to_rfc3339();
            warn!(task = %task.name, "refusing to delete non-deletable task; disabled instead");
            drop(tasks);
            return self.persist_tasks();
        }

        tasks.remove(id);
        drop(tasks);
        self.persist_tasks()
    }

    pub fn list_tasks(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<_> = self.tasks.lock().unwrap().values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    fn persist_tasks(&self) -> Result<()> {
        let tasks = self.tasks.lock().unwrap().clone();
        conduit_core::atomic::write_json(&self.tasks_path, &TaskStore { tasks })?;
        Ok(())
    }

    fn persist_executions(&self) -> Result<()> {
        let executions = self.executions.lock().unwrap().clone();
        conduit_core::atomic::write_json(&self.executions_path, &ExecutionStore { executions })?;
        Ok(())
    }

    fn record_execution(&self, execution: TaskExecution) {
        let mut executions = self.executions.lock().unwrap();
        executions.push(execution);
        let len = executions.len();
        if len > MAX_EXECUTIONS {
            executions.drain(..len - MAX_EXECUTIONS);
        }
        drop(executions);
        if let Err(e) = self.persist_executions() {
            warn!(error = %e, "failed to persist task executions");
        }
    }

    /// Collect due tasks and atomically flag them `Running` before returning,
    /// so the caller can dispatch without risking a double-fire on the next
    /// tick while the previous dispatch is still pending.
    fn collect_due(&self) -> Vec<ScheduledTask> {
        let now = Utc::now();
        let advance = Duration::seconds(self.config.advance_seconds);
        let mut tasks = self.tasks.lock().unwrap();
        let mut due = Vec::new();

        for task in tasks.values_mut() {
            if !task.enabled || task.status == TaskStatus::Running {
                continue;
            }
            let Some(next_run) = task.next_run else {
                continue;
            };
            let trigger_time = next_run - advance;
            if now >= trigger_time {
                task.status = TaskStatus::Running;
                due.push(task.clone());
            }
        }
        due
    }

    /// Apply the outcome of one dispatched task: recompute `next_run` (or
    /// mark `Once` tasks completed), and track consecutive failures toward
    /// the quarantine threshold.
    fn apply_outcome(&self, task_id: &str, result: &Result<()>) {
        let mut tasks = self.tasks.lock().unwrap();
        let Some(task) = tasks.get_mut(task_id) else {
            return;
        };

        let now = Utc::now();
        task.last_run = Some(now.to_rfc3339());
        task.updated_at = now.to_rfc3339();

        match result {
            Ok(()) => {
                task.run_count += 1;
                task.fail_count = 0;
                if task.is_once() {
                    task.status = TaskStatus::Completed;
                    task.enabled = false;
                    task.next_run = None;
                } else {
                    match next_run_time(&task.trigger, now) {
                        Ok(next) => {
                            task.next_run = next;
                            task.status = TaskStatus::Scheduled;
                        }
                        Err(e) => {
                            error!(task = %task.name, error = %e, "failed to recompute next run");
                            task.status = TaskStatus::Failed;
                        }
                    }
                }
            }
            Err(e) => {
                task.fail_count += 1;
                error!(task = %task.name, error = %e, fail_count = task.fail_count, "task execution failed");
                // Self-quarantine (spec §3 invariant / TestableProperty 7):
                // `fail_count >= 5 ⇒ status=failed ∧ enabled=false`. The spec
                // names no separate "quarantined" status.
                if task.fail_count >= self.config.fail_quarantine_threshold {
                    task.status = TaskStatus::Failed;
                    task.enabled = false;
                    warn!(task = %task.name, "task disabled after repeated failures");
                } else {
                    task.status = TaskStatus::Scheduled;
                }
            }
        }
    }

    /// One tick: dispatch every due task, bounded by `max_concurrent`.
    pub async fn tick(self: &Arc<Self>, handler: &Arc<dyn TaskHandler>) {
        let due = self.collect_due();
        if due.is_empty() {
            return;
        }
        if let Err(e) = self.persist_tasks() {
            warn!(error = %e, "failed to persist tasks after marking due tasks running");
        }

        for task in due {
            let engine = Arc::clone(self);
            let handler = Arc::clone(handler);
            let semaphore = Arc::clone(&self.semaphore);

            tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };

                let started_at = Utc::now().to_rfc3339();
                let result = handler.run(&task).await;
                let finished_at = Utc::now().to_rfc3339();

                engine.record_execution(TaskExecution {
                    task_id: task.id.clone(),
                    started_at,
                    finished_at: Some(finished_at),
                    success: result.is_ok(),
                    error: result.as_ref().err().map(|e| e.to_string()),
                });

                engine.apply_outcome(&task.id, &result);
                if let Err(e) = engine.persist_tasks() {
                    warn!(error = %e, "failed to persist tasks after dispatch");
                }
            });
        }
    }

    /// Main loop: ticks every `tick_seconds` until the process is asked to
    /// stop via `shutdown`.
    pub async fn run(self: Arc<Self>, handler: Arc<dyn TaskHandler>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!("scheduler engine started");
        let mut ticker = interval(std::time::Duration::from_secs(self.config.tick_seconds.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(&handler).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// On startup: tasks whose `next_run` is missing or already past are not
/// fired immediately. `Once` tasks already past are marked completed;
/// `interval`/`cron` tasks are rescheduled starting no sooner than
/// `now + CATCHUP_MIN_SECS` to avoid a burst right after restart.
fn apply_catchup_policy(tasks: &mut HashMap<String, ScheduledTask>) {
    let now = Utc::now();
    for task in tasks.values_mut() {
        let is_overdue = task.next_run.map(|next| next <= now).unwrap_or(true);
        if !is_overdue {
            continue;
        }

        if task.is_once() {
            task.status = TaskStatus::Completed;
            task.enabled = false;
            task.next_run = None;
            continue;
        }

        let floor = now + Duration::seconds(CATCHUP_MIN_SECS);
        match next_run_time(&task.trigger, floor) {
            Ok(next) => {
                task.next_run = next;
                task.status = TaskStatus::Scheduled;
            }
            Err(e) => {
                error!(task = %task.name, error = %e, "catch-up recompute failed");
                task.status = TaskStatus::Failed;
                task.enabled = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl TaskHandler for CountingHandler {
        async fn run(&self, _task: &ScheduledTask) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SchedulerError::InvalidTrigger("simulated failure".into()))
            } else {
                Ok(())
            }
        }
    }

    fn new_engine() -> (tempfile::TempDir, Arc<SchedulerEngine>) {
        let dir = tempfile::tempdir().unwrap();
        let engine = SchedulerEngine::load(
            dir.path().join("tasks.json"),
            dir.path().join("executions.json"),
            SchedulerConfig::default(),
        )
        .unwrap();
        (dir, Arc::new(engine))
    }

    #[tokio::test]
    async fn once_task_fires_and_completes() {
        let (_dir, engine) = new_engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let handler: Arc<dyn TaskHandler> = Arc::new(CountingHandler { calls: calls.clone(), fail: false });

        let task = engine
            .add_task(
                "t1",
                Trigger::Once { at: Utc::now() - Duration::seconds(1) },
                serde_json::json!({}),
            )
            .unwrap();

        // force past the advance window
        {
            let mut tasks = engine.tasks.lock().unwrap();
            tasks.get_mut(&task.id).unwrap().next_run = Some(Utc::now() - Duration::seconds(100));
        }

        engine.tick(&handler).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stored = engine.list_tasks();
        assert_eq!(stored[0].status, TaskStatus::Completed);
        assert!(!stored[0].enabled);
    }

    #[tokio::test]
    async fn repeated_failures_self_quarantine_as_failed() {
        let (_dir, engine) = new_engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let handler: Arc<dyn TaskHandler> = Arc::new(CountingHandler { calls: calls.clone(), fail: true });

        let task = engine
            .add_task(
                "t2",
                Trigger::Interval { minutes: Some(1), hours: None, days: None, start_time: None },
                serde_json::json!({}),
            )
            .unwrap();

        for _ in 0..5 {
            {
                let mut tasks = engine.tasks.lock().unwrap();
                let t = tasks.get_mut(&task.id).unwrap();
                t.next_run = Some(Utc::now() - Duration::seconds(100));
                t.status = TaskStatus::Scheduled;
            }
            engine.tick(&handler).await;
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        }

        let stored = engine.list_tasks();
        // TestableProperty 7: fail_count >= 5 => status=failed && enabled=false.
        assert_eq!(stored[0].fail_count, 5);
        assert_eq!(stored[0].status, TaskStatus::Failed);
        assert!(!stored[0].enabled);
    }

    #[test]
    fn catchup_marks_overdue_once_completed() {
        let mut tasks = HashMap::new();
        let mut task = ScheduledTask::new(
            "id1".into(),
            "n1".into(),
            Trigger::Once { at: Utc::now() - Duration::hours(1) },
            TaskType::Task,
            serde_json::json!({}),
        );
        task.next_run = Some(Utc::now() - Duration::hours(1));
        tasks.insert("id1".into(), task);

        apply_catchup_policy(&mut tasks);
        let t = &tasks["id1"];
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(!t.enabled);
    }

    #[test]
    fn catchup_pushes_interval_task_past_floor() {
        let mut tasks = HashMap::new();
        let mut task = ScheduledTask::new(
            "id2".into(),
            "n2".into(),
            Trigger::Interval { minutes: Some(5), hours: None, days: None, start_time: None },
            TaskType::Task,
            serde_json::json!({}),
        );
        task.next_run = Some(Utc::now() - Duration::hours(2));
        tasks.insert("id2".into(), task);

        let now = Utc::now();
        apply_catchup_policy(&mut tasks);
        let t = &tasks["id2"];
        assert!(t.next_run.unwrap() >= now + Duration::seconds(CATCHUP_MIN_SECS));
        assert_eq!(t.status, TaskStatus::Scheduled);
    }

    #[test]
    fn non_deletable_task_is_disabled_not_removed() {
        let (_dir, engine) = new_engine();
        let mut task = ScheduledTask::new(
            "sys1".into(),
            "system heartbeat".into(),
            Trigger::Interval { minutes: Some(10), hours: None, days: None, start_time: None },
            TaskType::Task,
            serde_json::json!({}),
        );
        task.id = "sys1".into();
        task.deletable = false;
        engine.create_task(task).unwrap();

        engine.remove_task("sys1").unwrap();

        let stored = engine.list_tasks();
        assert_eq!(stored.len(), 1, "non-deletable task must still exist");
        assert_eq!(stored[0].status, TaskStatus::Disabled);
        assert!(!stored[0].enabled);
    }

    #[test]
    fn deletable_task_is_removed() {
        let (_dir, engine) = new_engine();
        let task = engine
            .add_task("scratch", Trigger::Once { at: Utc::now() + Duration::hours(1) }, serde_json::json!({}))
            .unwrap();

        engine.remove_task(&task.id).unwrap();

        assert!(engine.list_tasks().is_empty());
    }

    #[test]
    fn create_task_carries_reminder_fields() {
        let (_dir, engine) = new_engine();
        let mut task = ScheduledTask::new(
            "r1".into(),
            "drink water".into(),
            Trigger::Once { at: Utc::now() + Duration::seconds(25) },
            TaskType::Reminder,
            serde_json::json!({}),
        );
        task.reminder_message = Some("喝水提醒".into());
        task.channel_id = Some("cli".into());
        task.chat_id = Some("user-1".into());

        let created = engine.create_task(task).unwrap();
        assert_eq!(created.task_type, TaskType::Reminder);
        assert_eq!(created.reminder_message.as_deref(), Some("喝水提醒"));
        assert_eq!(created.status, TaskStatus::Scheduled);
    }
}
