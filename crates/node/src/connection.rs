//! Connection Manager
//!
//! Owns one logical session per configured controller endpoint. Each
//! heartbeat cycle drives every session concurrently: send the current
//! report payload, receive zero or more commands, enqueue them into the
//! shared execution context. Every exchange is bounded by the cycle's
//! timeout budget (the heartbeat interval), and a slow or unreachable
//! endpoint never prevents the others from being serviced in the same
//! cycle.
//!
//! Concurrency is capped at (endpoint count + one auxiliary slot), the
//! auxiliary slot covering an out-of-band exchange such as a triggered
//! administrative heartbeat.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

use slate_common::command::{CommandStatus, ControllerCommand};
use slate_common::report::HeartbeatPayload;

use crate::context::StateContext;
use crate::metrics::NodeAgentMetrics;

/// Extra session slots beyond the configured endpoints.
const AUX_SESSION_SLOTS: usize = 1;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("endpoint {0} unreachable: {1}")]
    Unreachable(String, String),
    #[error("endpoint {0} protocol error: {1}")]
    Protocol(String, String),
}

/// Wire seam to one controller. Implementations authenticate however
/// the deployment requires; the agent only sees this trait.
#[async_trait]
pub trait ControllerEndpoint: Send + Sync {
    fn address(&self) -> &str;

    /// One heartbeat exchange: deliver the payload, collect any commands
    /// the controller has queued for this node.
    async fn heartbeat(
        &self,
        payload: &HeartbeatPayload,
    ) -> Result<Vec<ControllerCommand>, EndpointError>;

    /// Tear the session down. Default: nothing to release.
    async fn close(&self) {}
}

// ════════════════════════════════════════════════════════════════════════════
// ENDPOINT SESSION
// ════════════════════════════════════════════════════════════════════════════

/// Per-endpoint session state: the endpoint plus exchange counters.
pub struct EndpointSession {
    endpoint: Arc<dyn ControllerEndpoint>,
    heartbeats_sent: AtomicU64,
    commands_received: AtomicU64,
    consecutive_failures: AtomicU64,
}

/// Read-only session counters for observability.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SessionStats {
    pub address: String,
    pub heartbeats_sent: u64,
    pub commands_received: u64,
    pub consecutive_failures: u64,
}

impl EndpointSession {
    fn new(endpoint: Arc<dyn ControllerEndpoint>) -> Self {
        Self {
            endpoint,
            heartbeats_sent: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
        }
    }

    /// One exchange. Received commands are recorded as pending in the
    /// status ledger and appended to the shared queue, preserving the
    /// order the controller issued them in.
    async fn exchange(
        &self,
        payload: &HeartbeatPayload,
        ctx: &StateContext,
        metrics: &NodeAgentMetrics,
    ) -> Result<usize, EndpointError> {
        let commands = self.endpoint.heartbeat(payload).await?;
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let count = commands.len();
        self.commands_received
            .fetch_add(count as u64, Ordering::Relaxed);
        for command in &commands {
            metrics.record_command_received();
            ctx.record_command_status(command.id, command.kind(), CommandStatus::Pending);
        }
        ctx.add_commands(commands);
        Ok(count)
    }

    fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            address: self.endpoint.address().to_string(),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::SeqCst),
            commands_received: self.commands_received.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CONNECTION MANAGER
// ════════════════════════════════════════════════════════════════════════════

pub struct ConnectionManager {
    sessions: Vec<Arc<EndpointSession>>,
    slots: Arc<Semaphore>,
    metrics: Arc<NodeAgentMetrics>,
}

impl ConnectionManager {
    pub fn new(
        endpoints: Vec<Arc<dyn ControllerEndpoint>>,
        metrics: Arc<NodeAgentMetrics>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(endpoints.len() + AUX_SESSION_SLOTS));
        let sessions = endpoints
            .into_iter()
            .map(|e| Arc::new(EndpointSession::new(e)))
            .collect();
        Self {
            sessions,
            slots,
            metrics,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drive every session once, concurrently, each within
    /// `cycle_timeout`. Endpoint failures and timeouts are logged and
    /// counted; they never propagate and never stall sibling sessions.
    pub async fn drive_cycle(
        &self,
        ctx: &StateContext,
        payload: &HeartbeatPayload,
        cycle_timeout: Duration,
    ) {
        let exchanges = self.sessions.iter().map(|session| {
            let session = Arc::clone(session);
            let slots = Arc::clone(&self.slots);
            let metrics = Arc::clone(&self.metrics);
            async move {
                let Ok(_permit) = slots.acquire().await else {
                    return;
                };
                match timeout(cycle_timeout, session.exchange(payload, ctx, &metrics)).await {
                    Ok(Ok(count)) => {
                        metrics.record_heartbeat_sent();
                        debug!(
                            endpoint = session.endpoint.address(),
                            commands = count,
                            "heartbeat exchanged"
                        );
                    }
                    Ok(Err(e)) => {
                        metrics.record_heartbeat_failure();
                        session.record_failure();
                        warn!(
                            endpoint = session.endpoint.address(),
                            error = %e,
                            "heartbeat exchange failed"
                        );
                    }
                    Err(_) => {
                        metrics.record_heartbeat_failure();
                        session.record_failure();
                        warn!(
                            endpoint = session.endpoint.address(),
                            timeout_ms = cycle_timeout.as_millis() as u64,
                            "heartbeat exchange timed out"
                        );
                    }
                }
            }
        });
        join_all(exchanges).await;
    }

    /// Close every session. A failing endpoint close is not fatal to the
    /// rest of shutdown.
    pub async fn close(&self) {
        for session in &self.sessions {
            session.endpoint.close().await;
        }
    }

    pub fn session_stats(&self) -> Vec<SessionStats> {
        self.sessions.iter().map(|s| s.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use slate_common::command::CommandPayload;
    use std::collections::VecDeque;

    /// Scripted endpoint: returns queued command batches, or misbehaves
    /// on demand.
    struct MockEndpoint {
        address: String,
        batches: Mutex<VecDeque<Vec<ControllerCommand>>>,
        fail: bool,
        delay: Duration,
        closes: AtomicU64,
    }

    impl MockEndpoint {
        fn new(address: &str) -> Arc<Self> {
            Arc::new(Self {
                address: address.to_string(),
                batches: Mutex::new(VecDeque::new()),
                fail: false,
                delay: Duration::ZERO,
                closes: AtomicU64::new(0),
            })
        }

        fn failing(address: &str) -> Arc<Self> {
            Arc::new(Self {
                address: address.to_string(),
                batches: Mutex::new(VecDeque::new()),
                fail: true,
                delay: Duration::ZERO,
                closes: AtomicU64::new(0),
            })
        }

        fn slow(address: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                address: address.to_string(),
                batches: Mutex::new(VecDeque::new()),
                fail: false,
                delay,
                closes: AtomicU64::new(0),
            })
        }

        fn queue_batch(&self, batch: Vec<ControllerCommand>) {
            self.batches.lock().push_back(batch);
        }
    }

    #[async_trait]
    impl ControllerEndpoint for MockEndpoint {
        fn address(&self) -> &str {
            &self.address
        }

        async fn heartbeat(
            &self,
            _payload: &HeartbeatPayload,
        ) -> Result<Vec<ControllerCommand>, EndpointError> {
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(EndpointError::Unreachable(
                    self.address.clone(),
                    "connection refused".to_string(),
                ));
            }
            Ok(self.batches.lock().pop_front().unwrap_or_default())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn close_cmd(id: u64) -> ControllerCommand {
        ControllerCommand::new(id, CommandPayload::CloseContainer { container_id: id })
    }

    #[tokio::test]
    async fn commands_from_all_sessions_reach_the_queue() {
        let a = MockEndpoint::new("ctrl-a");
        let b = MockEndpoint::new("ctrl-b");
        a.queue_batch(vec![close_cmd(1), close_cmd(2)]);
        b.queue_batch(vec![close_cmd(3)]);

        let metrics = Arc::new(NodeAgentMetrics::new());
        let manager = ConnectionManager::new(
            vec![
                a.clone() as Arc<dyn ControllerEndpoint>,
                b.clone() as Arc<dyn ControllerEndpoint>,
            ],
            Arc::clone(&metrics),
        );
        let ctx = StateContext::new(Duration::from_millis(100));
        let payload = HeartbeatPayload::for_node("node-1");

        manager
            .drive_cycle(&ctx, &payload, Duration::from_secs(1))
            .await;

        assert_eq!(ctx.queued_command_count(), 3);
        assert_eq!(metrics.commands_received(), 3);
        assert_eq!(metrics.heartbeats_sent(), 2);
        // Every received command is pending in the status ledger.
        assert_eq!(ctx.drain_command_statuses().len(), 3);
    }

    #[tokio::test]
    async fn failing_endpoint_does_not_starve_healthy_one() {
        let slow = MockEndpoint::slow("ctrl-slow", Duration::from_secs(10));
        let bad = MockEndpoint::failing("ctrl-bad");
        let good = MockEndpoint::new("ctrl-good");
        good.queue_batch(vec![close_cmd(9)]);

        let metrics = Arc::new(NodeAgentMetrics::new());
        let manager = ConnectionManager::new(
            vec![
                slow as Arc<dyn ControllerEndpoint>,
                bad as Arc<dyn ControllerEndpoint>,
                good.clone() as Arc<dyn ControllerEndpoint>,
            ],
            Arc::clone(&metrics),
        );
        let ctx = StateContext::new(Duration::from_millis(100));
        let payload = HeartbeatPayload::for_node("node-1");

        let started = std::time::Instant::now();
        manager
            .drive_cycle(&ctx, &payload, Duration::from_millis(200))
            .await;

        // The slow endpoint timed out within the cycle budget, the bad
        // one failed, the good one delivered its command.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(ctx.queued_command_count(), 1);
        assert_eq!(metrics.heartbeats_sent(), 1);
        assert_eq!(metrics.heartbeat_failures(), 2);

        let stats = manager.session_stats();
        assert_eq!(stats[0].consecutive_failures, 1);
        assert_eq!(stats[1].consecutive_failures, 1);
        assert_eq!(stats[2].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn close_reaches_every_session() {
        let a = MockEndpoint::new("ctrl-a");
        let b = MockEndpoint::new("ctrl-b");
        let manager = ConnectionManager::new(
            vec![
                a.clone() as Arc<dyn ControllerEndpoint>,
                b.clone() as Arc<dyn ControllerEndpoint>,
            ],
            Arc::new(NodeAgentMetrics::new()),
        );
        manager.close().await;
        assert_eq!(a.closes.load(Ordering::SeqCst), 1);
        assert_eq!(b.closes.load(Ordering::SeqCst), 1);
    }
}
