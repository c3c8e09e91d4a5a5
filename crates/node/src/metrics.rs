//! Agent Metrics
//!
//! Lock-free counters for the control-plane agent. All fields are
//! `AtomicU64`; increments use `Ordering::Relaxed` (monotonic counters),
//! reads in `to_prometheus()` use `Ordering::SeqCst` for a consistent
//! snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters covering the heartbeat loop, command processing and
/// replication work. One instance per agent, shared by `Arc`.
#[derive(Debug, Default)]
pub struct NodeAgentMetrics {
    /// Heartbeat cycles entered by the main loop.
    heartbeat_cycles: AtomicU64,
    /// Successful heartbeat exchanges across all endpoint sessions.
    heartbeats_sent: AtomicU64,
    /// Failed or timed-out heartbeat exchanges.
    heartbeat_failures: AtomicU64,
    /// Commands received from controller sessions.
    commands_received: AtomicU64,
    /// Commands dequeued and dispatched (any outcome).
    commands_handled: AtomicU64,
    /// Commands dropped because no handler was registered.
    commands_dropped: AtomicU64,
    /// Replication jobs accepted by the supervisor.
    replication_requested: AtomicU64,
    /// Replication jobs skipped as duplicates of queued/in-flight work.
    replication_skipped: AtomicU64,
    /// Replication jobs completed successfully.
    replication_success: AtomicU64,
    /// Replication jobs that failed.
    replication_failure: AtomicU64,
    /// Bytes imported by successful replication jobs.
    replication_bytes: AtomicU64,
    /// Total wall-clock time spent replicating, in microseconds.
    replication_busy_micros: AtomicU64,
    /// Pause-monitor warnings (observed scheduling stalls).
    pause_warnings: AtomicU64,
}

impl NodeAgentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_heartbeat_cycle(&self) {
        self.heartbeat_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_failure(&self) {
        self.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_handled(&self) {
        self.commands_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_dropped(&self) {
        self.commands_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replication_requested(&self) {
        self.replication_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replication_skipped(&self) {
        self.replication_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replication_success(&self) {
        self.replication_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replication_failure(&self) {
        self.replication_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replication_bytes(&self, bytes: u64) {
        self.replication_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_replication_busy_micros(&self, micros: u64) {
        self.replication_busy_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn record_pause_warning(&self) {
        self.pause_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_cycles(&self) -> u64 {
        self.heartbeat_cycles.load(Ordering::SeqCst)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::SeqCst)
    }

    pub fn heartbeat_failures(&self) -> u64 {
        self.heartbeat_failures.load(Ordering::SeqCst)
    }

    pub fn commands_received(&self) -> u64 {
        self.commands_received.load(Ordering::SeqCst)
    }

    pub fn commands_handled(&self) -> u64 {
        self.commands_handled.load(Ordering::SeqCst)
    }

    pub fn commands_dropped(&self) -> u64 {
        self.commands_dropped.load(Ordering::SeqCst)
    }

    pub fn replication_requested(&self) -> u64 {
        self.replication_requested.load(Ordering::SeqCst)
    }

    pub fn replication_skipped(&self) -> u64 {
        self.replication_skipped.load(Ordering::SeqCst)
    }

    pub fn replication_success(&self) -> u64 {
        self.replication_success.load(Ordering::SeqCst)
    }

    pub fn replication_failure(&self) -> u64 {
        self.replication_failure.load(Ordering::SeqCst)
    }

    pub fn replication_bytes(&self) -> u64 {
        self.replication_bytes.load(Ordering::SeqCst)
    }

    pub fn replication_busy_micros(&self) -> u64 {
        self.replication_busy_micros.load(Ordering::SeqCst)
    }

    pub fn pause_warnings(&self) -> u64 {
        self.pause_warnings.load(Ordering::SeqCst)
    }

    /// Prometheus text exposition of every counter.
    pub fn to_prometheus(&self) -> String {
        let series: [(&str, &str, u64); 13] = [
            (
                "slate_heartbeat_cycles_total",
                "Heartbeat cycles entered by the main loop",
                self.heartbeat_cycles(),
            ),
            (
                "slate_heartbeats_sent_total",
                "Successful heartbeat exchanges",
                self.heartbeats_sent(),
            ),
            (
                "slate_heartbeat_failures_total",
                "Failed or timed-out heartbeat exchanges",
                self.heartbeat_failures(),
            ),
            (
                "slate_commands_received_total",
                "Commands received from controllers",
                self.commands_received(),
            ),
            (
                "slate_commands_handled_total",
                "Commands dequeued and dispatched",
                self.commands_handled(),
            ),
            (
                "slate_commands_dropped_total",
                "Commands dropped for lack of a handler",
                self.commands_dropped(),
            ),
            (
                "slate_replication_requested_total",
                "Replication jobs accepted",
                self.replication_requested(),
            ),
            (
                "slate_replication_skipped_total",
                "Replication jobs skipped as duplicates",
                self.replication_skipped(),
            ),
            (
                "slate_replication_success_total",
                "Replication jobs completed",
                self.replication_success(),
            ),
            (
                "slate_replication_failure_total",
                "Replication jobs failed",
                self.replication_failure(),
            ),
            (
                "slate_replication_bytes_total",
                "Bytes imported by replication",
                self.replication_bytes(),
            ),
            (
                "slate_replication_busy_micros_total",
                "Wall-clock microseconds spent replicating",
                self.replication_busy_micros(),
            ),
            (
                "slate_pause_warnings_total",
                "Observed scheduling stalls",
                self.pause_warnings(),
            ),
        ];
        let mut out = String::with_capacity(1024);
        for (name, help, value) in series {
            out.push_str(&format!("# HELP {} {}\n", name, help));
            out.push_str(&format!("# TYPE {} counter\n", name));
            out.push_str(&format!("{} {}\n", name, value));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = NodeAgentMetrics::new();
        m.record_heartbeat_cycle();
        m.record_heartbeat_cycle();
        m.record_command_handled();
        m.record_replication_bytes(512);
        m.record_replication_bytes(512);
        assert_eq!(m.heartbeat_cycles(), 2);
        assert_eq!(m.commands_handled(), 1);
        assert_eq!(m.replication_bytes(), 1024);
    }

    #[test]
    fn prometheus_exposition_contains_all_series() {
        let m = NodeAgentMetrics::new();
        m.record_command_dropped();
        let text = m.to_prometheus();
        assert!(text.contains("# TYPE slate_commands_dropped_total counter"));
        assert!(text.contains("slate_commands_dropped_total 1"));
        assert!(text.contains("slate_heartbeat_cycles_total 0"));
    }
}
