use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use conduit_protocol::UnifiedMessage;

use crate::{channel::Channel, error::ChannelError};

/// Minimum delay between reconnect attempts (seconds).
const BACKOFF_BASE_SECS: u64 = 5;
/// Maximum delay between reconnect attempts (seconds).
const BACKOFF_MAX_SECS: u64 = 300;
/// Maximum number of reconnect attempts before giving up.
const MAX_ATTEMPTS: u32 = 10;
/// Jitter fraction applied to each delay (±10 %).
const JITTER_FRACTION: f64 = 0.10;

/// Registers channel adapters and fans their inbound traffic into a single
/// queue, as consumed by the gateway's dispatch loop.
pub struct ChannelManager {
    channels: HashMap<String, Box<dyn Channel + Send + Sync>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// Register a channel adapter and wire its inbound sender. If a channel
    /// with the same name is already registered, it is replaced.
    pub fn register(
        &mut self,
        mut channel: Box<dyn Channel + Send + Sync>,
        inbound: mpsc::Sender<UnifiedMessage>,
    ) {
        let name = channel.channel_name().to_string();
        info!(channel = %name, "registering channel adapter");
        channel.set_inbound(inbound);
        self.channels.insert(name, channel);
    }

    /// Start every registered adapter that is not already running.
    pub async fn start_all(&mut self) {
        for (name, channel) in self.channels.iter_mut() {
            if channel.is_running() {
                continue;
            }
            info!(channel = %name, "starting channel");
            if let Err(e) = start_with_backoff(name, channel.as_mut()).await {
                error!(channel = %name, error = %e, "failed to start channel after retries");
            }
        }
    }

    pub async fn stop_all(&mut self) {
        for (name, channel) in self.channels.iter_mut() {
            info!(channel = %name, "stopping channel");
            if let Err(e) = channel.stop().await {
                warn!(channel = %name, error = %e, "error while stopping channel");
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&(dyn Channel + Send + Sync)> {
        self.channels.get(name).map(|b| b.as_ref())
    }

    /// Current `(name, is_running)` for every registered adapter, sorted by
    /// name for deterministic output.
    pub fn statuses(&self) -> Vec<(String, bool)> {
        let mut result: Vec<(String, bool)> = self
            .channels
            .iter()
            .map(|(name, ch)| (name.clone(), ch.is_running()))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Attempt to start a single channel with exponential backoff and ±10% jitter.
/// Schedule: 5s -> 10s -> 20s -> ... -> 300s (cap), up to `MAX_ATTEMPTS` tries.
async fn start_with_backoff(name: &str, channel: &mut dyn Channel) -> Result<(), ChannelError> {
    let mut delay_secs = BACKOFF_BASE_SECS;

    for attempt in 1..=MAX_ATTEMPTS {
        match channel.start().await {
            Ok(()) => {
                info!(channel = %name, attempt, "channel started successfully");
                return Ok(());
            }
            Err(e) if attempt == MAX_ATTEMPTS => {
                return Err(e);
            }
            Err(e) => {
                let jitter = jitter_secs(delay_secs);
                let total = delay_secs + jitter;
                warn!(
                    channel = %name,
                    attempt,
                    max = MAX_ATTEMPTS,
                    error = %e,
                    retry_after_secs = total,
                    "channel start failed, retrying with backoff"
                );
                sleep(Duration::from_secs(total)).await;
                delay_secs = (delay_secs * 2).min(BACKOFF_MAX_SECS);
            }
        }
    }

    unreachable!("backoff loop exited without returning")
}

/// Jitter offset (0..JITTER_FRACTION*base_secs) derived from the current
/// monotonic timestamp, avoiding a dependency on a random number generator
/// for what is purely an anti-thundering-herd nicety.
fn jitter_secs(base_secs: u64) -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    let max_jitter = ((base_secs as f64) * JITTER_FRACTION) as u64;
    if max_jitter == 0 {
        return 0;
    }
    (nanos as u64) % max_jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conduit_protocol::OutgoingMessage;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyChannel {
        name: String,
        running: Arc<AtomicBool>,
        fail_until_attempt: u32,
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Channel for FlakyChannel {
        fn channel_name(&self) -> &str {
            &self.name
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn set_inbound(&mut self, _tx: mpsc::Sender<UnifiedMessage>) {}

        async fn start(&mut self) -> Result<(), ChannelError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < self.fail_until_attempt {
                return Err(ChannelError::ConnectionFailed("simulated".into()));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), ChannelError> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn send_message(&self, _msg: &OutgoingMessage) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn send_text(
            &self,
            _chat_id: &str,
            _text: &str,
            _reply_to: Option<&str>,
            _thread_id: Option<&str>,
        ) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn send_typing(&self, _chat_id: &str) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn eventually_succeeds_after_transient_failures() {
        let running = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicU32::new(0));
        let mut channel = FlakyChannel {
            name: "flaky".into(),
            running: running.clone(),
            fail_until_attempt: 3,
            attempts: attempts.clone(),
        };
        let result = start_with_backoff("flaky", &mut channel).await;
        assert!(result.is_ok());
        assert!(running.load(Ordering::SeqCst));
        assert!(attempts.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn jitter_never_exceeds_fraction() {
        for base in [5, 10, 20, 40, 80, 160, 300] {
            let j = jitter_secs(base);
            assert!(j <= (base as f64 * JITTER_FRACTION) as u64 + 1);
        }
    }
}
