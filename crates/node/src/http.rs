//! Observability Endpoint
//!
//! Read-only HTTP surface for operators and probes. The agent takes no
//! instructions over HTTP; every mutating action arrives as a
//! controller command through the heartbeat exchange, so this router
//! has GET routes only:
//!
//! - `GET /health`  liveness: lifecycle state, cycle count, uptime
//! - `GET /metrics` Prometheus text exposition
//! - `GET /status`  command/replication/session/upgrade detail

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::info;

use slate_common::lifecycle::NodeLifecycleState;

use crate::connection::SessionStats;
use crate::state_machine::NodeStateMachine;

#[derive(Clone)]
pub struct AppState {
    machine: Arc<NodeStateMachine>,
    started_at: Instant,
}

impl AppState {
    pub fn new(machine: Arc<NodeStateMachine>) -> Self {
        Self {
            machine,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub node_id: String,
    pub lifecycle_state: String,
    pub execution_count: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub lifecycle_state: String,
    pub exit_reason: Option<String>,
    pub commands_handled: u64,
    pub queued_commands: usize,
    pub replication_pending: usize,
    pub upgrade_state: String,
    pub sessions: Vec<SessionStats>,
}

fn build_health(state: &AppState) -> HealthResponse {
    let lifecycle = state.machine.lifecycle_state();
    HealthResponse {
        status: if lifecycle == NodeLifecycleState::Shutdown {
            "shutdown"
        } else {
            "ok"
        },
        node_id: state.machine.node_id().to_string(),
        lifecycle_state: lifecycle.to_string(),
        execution_count: state.machine.execution_count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    }
}

fn build_status(state: &AppState) -> StatusResponse {
    let machine = &state.machine;
    StatusResponse {
        node_id: machine.node_id().to_string(),
        lifecycle_state: machine.lifecycle_state().to_string(),
        exit_reason: machine.exit_reason().map(|r| format!("{:?}", r).to_lowercase()),
        commands_handled: machine.commands_handled(),
        queued_commands: machine.context().queued_command_count(),
        replication_pending: machine.replication_supervisor().pending_count(),
        upgrade_state: machine
            .query_upgrade_status()
            .map(|s| s.state.to_string())
            .unwrap_or_else(|e| format!("error: {}", e)),
        sessions: machine.session_stats(),
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(build_health(&state))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.machine.metrics().to_prometheus())
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(build_status(&state))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .with_state(state)
}

/// Serve the router until `shutdown` fires.
pub async fn serve(port: u16, state: AppState, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "observability endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.notified().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use slate_common::config::AgentConfig;

    use crate::replication::{ContainerReplicator, ReplicationError, ReplicationJob};
    use crate::reports::InMemoryRevocationList;
    use crate::state_machine::NodeStopService;
    use crate::storage::{EngineSlot, InMemoryEngine};
    use crate::upgrade::{InMemoryLayoutStore, SOFTWARE_LAYOUT_VERSION};

    struct NullReplicator;
    #[async_trait::async_trait]
    impl ContainerReplicator for NullReplicator {
        async fn replicate(&self, _job: &ReplicationJob) -> Result<u64, ReplicationError> {
            Ok(0)
        }
    }

    struct NullStop;
    impl NodeStopService for NullStop {
        fn stop_service(&self) {}
    }

    fn test_state() -> AppState {
        let slot = Arc::new(EngineSlot::new());
        slot.publish(InMemoryEngine::new().handle()).expect("publish");
        let machine = NodeStateMachine::new(
            AgentConfig {
                node_id: Some("node-http".to_string()),
                heartbeat_interval_ms: 100,
                ..AgentConfig::default()
            },
            slot,
            Arc::new(NullReplicator),
            Vec::new(),
            Arc::new(InMemoryLayoutStore::at_version(SOFTWARE_LAYOUT_VERSION)),
            Arc::new(InMemoryRevocationList::new()),
            Arc::new(NullStop),
        )
        .expect("machine");
        AppState::new(machine)
    }

    #[tokio::test]
    async fn health_reflects_lifecycle() {
        let state = test_state();
        let health = build_health(&state);
        assert_eq!(health.status, "ok");
        assert_eq!(health.node_id, "node-http");
        assert_eq!(health.lifecycle_state, "init");

        state.machine.close().await;
        let health = build_health(&state);
        assert_eq!(health.status, "shutdown");
    }

    #[tokio::test]
    async fn status_carries_agent_detail() {
        let state = test_state();
        let status = build_status(&state);
        assert_eq!(status.commands_handled, 0);
        assert_eq!(status.queued_commands, 0);
        assert_eq!(status.upgrade_state, "not_started");
        assert!(status.exit_reason.is_none());
        assert!(status.sessions.is_empty());
        // The router builds with this state; smoke-check construction.
        let _router = router(state);
    }
}
