//! Bridges scheduled tasks (spec §4.7) to the channel adapters. A
//! `task_type=reminder` task sends `reminder_message` to `channel_id`/
//! `chat_id`; a `task_type=task` falls back to its opaque `action` payload
//! naming the channel/chat/text. Anything richer (invoking the agent on a
//! schedule, templated digests, running `prompt`/`script_path`) is a
//! skills-layer concern and out of scope here.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use conduit_channels::ChannelManager;
use conduit_scheduler::{ScheduledTask, SchedulerError, TaskHandler, TaskType};

pub struct ReminderTaskHandler {
    pub channels: Arc<ChannelManager>,
}

#[async_trait]
impl TaskHandler for ReminderTaskHandler {
    async fn run(&self, task: &ScheduledTask) -> Result<(), SchedulerError> {
        let (channel, chat_id, text) = match task.task_type {
            TaskType::Reminder => {
                let channel = task
                    .channel_id
                    .as_deref()
                    .ok_or_else(|| SchedulerError::InvalidTrigger("reminder task missing 'channel_id'".to_string()))?;
                let chat_id = task
                    .chat_id
                    .as_deref()
                    .ok_or_else(|| SchedulerError::InvalidTrigger("reminder task missing 'chat_id'".to_string()))?;
                let text = task.reminder_message.as_deref().unwrap_or("（提醒）");
                (channel, chat_id, text)
            }
            TaskType::Task => {
                let channel = task
                    .action
                    .get("channel")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| SchedulerError::InvalidTrigger("task action missing 'channel'".to_string()))?;
                let chat_id = task
                    .action
                    .get("chat_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| SchedulerError::InvalidTrigger("task action missing 'chat_id'".to_string()))?;
                let text = task.action.get("text").and_then(|v| v.as_str()).unwrap_or("（提醒）");
                (channel, chat_id, text)
            }
        };

        let Some(adapter) = self.channels.get(channel) else {
            warn!(task = %task.name, channel, "no adapter registered for scheduled task's channel");
            return Err(SchedulerError::InvalidTrigger(format!("unknown channel '{channel}'")));
        };

        adapter
            .send_text(chat_id, text, None, None)
            .await
            .map_err(|e| SchedulerError::InvalidTrigger(e.to_string()))
    }
}
