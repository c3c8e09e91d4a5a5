//! Pause Monitor
//!
//! Detects runtime stalls (an overloaded scheduler, a suspended VM, a
//! host under memory pressure) by sleeping a short fixed interval in a
//! loop and comparing the observed elapsed time against the expected
//! one. A modest overshoot is logged at info, a large one at warn and
//! counted in the agent metrics.
//!
//! The monitor is purely observational; escalation policy belongs to
//! the operator reading the logs and metrics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::metrics::NodeAgentMetrics;

#[derive(Debug, Clone, Copy)]
pub struct PauseMonitorConfig {
    /// Length of each probe sleep.
    pub sleep_interval: Duration,
    /// Overshoot beyond which a pause is logged at info.
    pub info_threshold: Duration,
    /// Overshoot beyond which a pause is logged at warn and counted.
    pub warn_threshold: Duration,
}

impl Default for PauseMonitorConfig {
    fn default() -> Self {
        Self {
            sleep_interval: Duration::from_millis(500),
            info_threshold: Duration::from_secs(1),
            warn_threshold: Duration::from_secs(10),
        }
    }
}

/// Severity of one observed stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseLevel {
    Info,
    Warn,
}

/// Classify one probe: how far past the expected sleep did we wake?
/// Returns `None` when the overshoot is within normal jitter.
pub fn classify_pause(config: &PauseMonitorConfig, slept: Duration) -> Option<PauseLevel> {
    let overshoot = slept.saturating_sub(config.sleep_interval);
    if overshoot >= config.warn_threshold {
        Some(PauseLevel::Warn)
    } else if overshoot >= config.info_threshold {
        Some(PauseLevel::Info)
    } else {
        None
    }
}

pub struct PauseMonitor {
    config: PauseMonitorConfig,
    metrics: Arc<NodeAgentMetrics>,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl PauseMonitor {
    pub fn new(config: PauseMonitorConfig, metrics: Arc<NodeAgentMetrics>) -> Self {
        Self {
            config,
            metrics,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the probe loop. Calling twice is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let config = self.config;
        let metrics = Arc::clone(&self.metrics);
        let shutdown = Arc::clone(&self.shutdown);
        let stopping = Arc::clone(&self.stopping);
        *self.task.lock() = Some(tokio::spawn(async move {
            loop {
                let before = Instant::now();
                tokio::select! {
                    _ = tokio::time::sleep(config.sleep_interval) => {}
                    _ = shutdown.notified() => break,
                }
                if stopping.load(Ordering::Acquire) {
                    break;
                }
                let slept = before.elapsed();
                match classify_pause(&config, slept) {
                    Some(PauseLevel::Warn) => {
                        metrics.record_pause_warning();
                        warn!(
                            slept_ms = slept.as_millis() as u64,
                            expected_ms = config.sleep_interval.as_millis() as u64,
                            "long scheduling pause detected"
                        );
                    }
                    Some(PauseLevel::Info) => {
                        info!(
                            slept_ms = slept.as_millis() as u64,
                            expected_ms = config.sleep_interval.as_millis() as u64,
                            "scheduling pause detected"
                        );
                    }
                    None => {}
                }
            }
        }));
    }

    /// Stop the probe loop. Safe to call more than once.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
