//! `TaskMonitor`: tracks per-task LLM-call health and decides when the
//! Reasoning Engine should retry in place versus switch to a fallback model
//! (spec §4.4.4, §7).

use std::sync::atomic::{AtomicU32, Ordering};

/// Configuration for one monitor instance — normally one per task, built
/// from the reasoning config's retry/switch policy.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Consecutive LLM-call failures (timeouts or transport errors) before
    /// a model switch is requested.
    pub switch_after_failures: u32,
    /// Retries granted per failure before the monitor gives up and defers
    /// to a model switch.
    pub retry_budget: u32,
    /// Fallback model name the engine should switch `current_model` to.
    pub fallback_model: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            switch_after_failures: 3,
            retry_budget: 2,
            fallback_model: "fallback".into(),
        }
    }
}

/// Tracks consecutive LLM-call failures for a single task and answers the
/// two questions the engine's per-iteration gate needs: "should I switch
/// models now" and "do I still have a retry for this failure".
#[derive(Debug)]
pub struct TaskMonitor {
    config: MonitorConfig,
    consecutive_failures: AtomicU32,
    retries_used_this_failure: AtomicU32,
    switch_performed: AtomicU32,
}

impl TaskMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            consecutive_failures: AtomicU32::new(0),
            retries_used_this_failure: AtomicU32::new(0),
            switch_performed: AtomicU32::new(0),
        }
    }

    /// Per-iteration gate: true if accumulated timeouts warrant a switch
    /// before the next REASON call even attempts one.
    pub fn should_switch(&self) -> bool {
        self.consecutive_failures.load(Ordering::SeqCst) >= self.config.switch_after_failures
    }

    pub fn fallback_model(&self) -> &str {
        &self.config.fallback_model
    }

    /// Record a successful LLM call — resets all failure bookkeeping.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.retries_used_this_failure.store(0, Ordering::SeqCst);
    }

    /// Record a failed LLM call. Returns whether the caller should retry in
    /// place (sleep 2s, per spec §7) or give up on this model and switch.
    pub fn record_failure(&self) -> RetryDecision {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        let used = self.retries_used_this_failure.fetch_add(1, Ordering::SeqCst) + 1;
        if used <= self.config.retry_budget {
            RetryDecision::RetryInPlace
        } else {
            self.retries_used_this_failure.store(0, Ordering::SeqCst);
            RetryDecision::SwitchModel
        }
    }

    /// Called by the engine after a completed switch so the next failure
    /// run starts with a clean slate.
    pub fn record_switch_performed(&self) {
        self.switch_performed.fetch_add(1, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.retries_used_this_failure.store(0, Ordering::SeqCst);
    }

    pub fn switches_performed(&self) -> u32 {
        self.switch_performed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryInPlace,
    SwitchModel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_in_place_until_budget_exhausted_then_switches() {
        let monitor = TaskMonitor::new(MonitorConfig { retry_budget: 2, ..Default::default() });
        assert_eq!(monitor.record_failure(), RetryDecision::RetryInPlace);
        assert_eq!(monitor.record_failure(), RetryDecision::RetryInPlace);
        assert_eq!(monitor.record_failure(), RetryDecision::SwitchModel);
    }

    #[test]
    fn success_resets_failure_counters() {
        let monitor = TaskMonitor::new(MonitorConfig::default());
        monitor.record_failure();
        monitor.record_failure();
        monitor.record_success();
        assert!(!monitor.should_switch());
    }

    #[test]
    fn should_switch_after_threshold_consecutive_failures() {
        let monitor = TaskMonitor::new(MonitorConfig { switch_after_failures: 3, retry_budget: 10, ..Default::default() });
        monitor.record_failure();
        monitor.record_failure();
        assert!(!monitor.should_switch());
        monitor.record_failure();
        assert!(monitor.should_switch());
    }
}
