//! Report Manager
//!
//! Owns the fixed set of report publishers (node, container, pipeline,
//! command-status, revocation-list) and assembles their current
//! snapshots into the payload attached to each outgoing heartbeat.
//!
//! `init()` refreshes every publisher once and starts one polling task
//! per publisher; `shutdown()` stops them. Both are called exactly once
//! by the owning lifecycle. Command-status entries are accumulated, not
//! overwritten, between heartbeats: a snapshot taken by `assemble()`
//! removes them from the buffer so each outcome is reported once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use slate_common::command::NodeOperationalState;
use slate_common::report::{
    CommandStatusReport, ContainerReport, HeartbeatPayload, NodeReport, PipelineReport,
    RevocationListReport,
};

use crate::context::StateContext;
use crate::storage::{EngineSlot, VolumeHealthTracker};

/// The report kinds bundled into a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    Node,
    Container,
    Pipeline,
    CommandStatus,
    RevocationList,
}

/// One publisher's current snapshot.
#[derive(Debug, Clone)]
pub enum ReportSnapshot {
    Node(NodeReport),
    Container(ContainerReport),
    Pipeline(PipelineReport),
    CommandStatus(CommandStatusReport),
    RevocationList(RevocationListReport),
}

/// Produces one kind of report on a fixed polling interval.
pub trait ReportPublisher: Send + Sync {
    fn kind(&self) -> ReportKind;
    fn interval(&self) -> Duration;
    fn publish(&self) -> ReportSnapshot;
}

// ════════════════════════════════════════════════════════════════════════════
// HOLDERS FED BY OTHER COMPONENTS
// ════════════════════════════════════════════════════════════════════════════

/// Administrative operational state as last set by the controller.
#[derive(Default)]
pub struct OperationalStateHolder {
    state: RwLock<(NodeOperationalState, u64)>,
}

impl OperationalStateHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, state: NodeOperationalState, expiry_epoch_secs: u64) {
        *self.state.write() = (state, expiry_epoch_secs);
    }

    pub fn get(&self) -> (NodeOperationalState, u64) {
        *self.state.read()
    }
}

/// Pipeline membership as maintained by the out-of-scope write path.
#[derive(Default)]
pub struct PipelineTracker {
    ids: RwLock<Vec<String>>,
}

impl PipelineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: impl Into<String>) {
        self.ids.write().push(id.into());
    }

    pub fn remove(&self, id: &str) {
        self.ids.write().retain(|p| p != id);
    }

    pub fn list(&self) -> Vec<String> {
        self.ids.read().clone()
    }
}

/// Certificate-revocation processing position, fed by the security layer.
pub trait RevocationSource: Send + Sync {
    fn processed_sequence(&self) -> u64;
    fn pending_ids(&self) -> Vec<u64>;
}

#[derive(Default)]
pub struct InMemoryRevocationList {
    sequence: AtomicU64,
    pending: Mutex<Vec<u64>>,
}

impl InMemoryRevocationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_processed_sequence(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::Release);
    }

    pub fn set_pending(&self, ids: Vec<u64>) {
        *self.pending.lock() = ids;
    }
}

impl RevocationSource for InMemoryRevocationList {
    fn processed_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    fn pending_ids(&self) -> Vec<u64> {
        self.pending.lock().clone()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// PUBLISHERS
// ════════════════════════════════════════════════════════════════════════════

pub struct NodeReportPublisher {
    engine: Arc<EngineSlot>,
    volume_health: Arc<VolumeHealthTracker>,
    operational: Arc<OperationalStateHolder>,
    interval: Duration,
}

impl NodeReportPublisher {
    pub fn new(
        engine: Arc<EngineSlot>,
        volume_health: Arc<VolumeHealthTracker>,
        operational: Arc<OperationalStateHolder>,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            volume_health,
            operational,
            interval,
        }
    }
}

impl ReportPublisher for NodeReportPublisher {
    fn kind(&self) -> ReportKind {
        ReportKind::Node
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn publish(&self) -> ReportSnapshot {
        let volumes = self
            .engine
            .get()
            .map(|e| e.container_set.volume_reports())
            .unwrap_or_default();
        let (operational_state, _) = self.operational.get();
        ReportSnapshot::Node(NodeReport {
            volumes,
            failed_volume_count: self.volume_health.failed_volume_count(),
            operational_state,
        })
    }
}

pub struct ContainerReportPublisher {
    engine: Arc<EngineSlot>,
    interval: Duration,
}

impl ContainerReportPublisher {
    pub fn new(engine: Arc<EngineSlot>, interval: Duration) -> Self {
        Self { engine, interval }
    }
}

impl ReportPublisher for ContainerReportPublisher {
    fn kind(&self) -> ReportKind {
        ReportKind::Container
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn publish(&self) -> ReportSnapshot {
        let report = self
            .engine
            .get()
            .map(|e| e.container_set.container_report())
            .unwrap_or_default();
        ReportSnapshot::Container(report)
    }
}

pub struct PipelineReportPublisher {
    tracker: Arc<PipelineTracker>,
    interval: Duration,
}

impl PipelineReportPublisher {
    pub fn new(tracker: Arc<PipelineTracker>, interval: Duration) -> Self {
        Self { tracker, interval }
    }
}

impl ReportPublisher for PipelineReportPublisher {
    fn kind(&self) -> ReportKind {
        ReportKind::Pipeline
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn publish(&self) -> ReportSnapshot {
        ReportSnapshot::Pipeline(PipelineReport {
            pipeline_ids: self.tracker.list(),
        })
    }
}

pub struct CommandStatusReportPublisher {
    ctx: Arc<StateContext>,
    interval: Duration,
}

impl CommandStatusReportPublisher {
    pub fn new(ctx: Arc<StateContext>, interval: Duration) -> Self {
        Self { ctx, interval }
    }
}

impl ReportPublisher for CommandStatusReportPublisher {
    fn kind(&self) -> ReportKind {
        ReportKind::CommandStatus
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn publish(&self) -> ReportSnapshot {
        ReportSnapshot::CommandStatus(CommandStatusReport {
            entries: self.ctx.drain_command_statuses(),
        })
    }
}

pub struct RevocationListPublisher {
    source: Arc<dyn RevocationSource>,
    interval: Duration,
}

impl RevocationListPublisher {
    pub fn new(source: Arc<dyn RevocationSource>, interval: Duration) -> Self {
        Self { source, interval }
    }
}

impl ReportPublisher for RevocationListPublisher {
    fn kind(&self) -> ReportKind {
        ReportKind::RevocationList
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn publish(&self) -> ReportSnapshot {
        ReportSnapshot::RevocationList(RevocationListReport {
            processed_sequence: self.source.processed_sequence(),
            pending_ids: self.source.pending_ids(),
        })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// REPORT MANAGER
// ════════════════════════════════════════════════════════════════════════════

pub struct ReportManager {
    node_id: String,
    publishers: Vec<Arc<dyn ReportPublisher>>,
    buffer: Arc<RwLock<HashMap<ReportKind, ReportSnapshot>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    initialized: AtomicBool,
    shut: AtomicBool,
}

impl ReportManager {
    pub fn new(node_id: impl Into<String>, publishers: Vec<Arc<dyn ReportPublisher>>) -> Self {
        Self {
            node_id: node_id.into(),
            publishers,
            buffer: Arc::new(RwLock::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            initialized: AtomicBool::new(false),
            shut: AtomicBool::new(false),
        }
    }

    fn merge_into_buffer(
        buffer: &RwLock<HashMap<ReportKind, ReportSnapshot>>,
        kind: ReportKind,
        snapshot: ReportSnapshot,
    ) {
        let mut buffer = buffer.write();
        match (buffer.get_mut(&kind), snapshot) {
            // Command outcomes accumulate until a heartbeat carries them.
            (
                Some(ReportSnapshot::CommandStatus(existing)),
                ReportSnapshot::CommandStatus(mut fresh),
            ) => {
                existing.entries.append(&mut fresh.entries);
            }
            (_, snapshot) => {
                buffer.insert(kind, snapshot);
            }
        }
    }

    /// Refresh every publisher's snapshot immediately.
    pub fn refresh_now(&self) {
        for publisher in &self.publishers {
            Self::merge_into_buffer(&self.buffer, publisher.kind(), publisher.publish());
        }
    }

    /// Take the first snapshot and start the polling tasks. Called once
    /// by the owning lifecycle; later calls are no-ops.
    pub fn init(&self) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }
        self.refresh_now();
        let mut tasks = self.tasks.lock();
        for publisher in &self.publishers {
            let publisher = Arc::clone(publisher);
            let buffer = Arc::clone(&self.buffer);
            let shutdown = Arc::clone(&self.shutdown);
            let stopping = Arc::clone(&self.stopping);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(publisher.interval()) => {}
                        _ = shutdown.notified() => break,
                    }
                    if stopping.load(Ordering::Acquire) {
                        break;
                    }
                    Self::merge_into_buffer(&buffer, publisher.kind(), publisher.publish());
                }
                debug!("report publisher task stopped");
            }));
        }
    }

    /// Bundle the current snapshots into a heartbeat payload.
    /// Command-status entries are removed from the buffer so each
    /// outcome rides exactly one payload.
    pub fn assemble(&self) -> HeartbeatPayload {
        let mut buffer = self.buffer.write();
        let mut payload = HeartbeatPayload::for_node(self.node_id.clone());
        if let Some(ReportSnapshot::Node(r)) = buffer.get(&ReportKind::Node) {
            payload.node_report = Some(r.clone());
        }
        if let Some(ReportSnapshot::Container(r)) = buffer.get(&ReportKind::Container) {
            payload.container_report = Some(r.clone());
        }
        if let Some(ReportSnapshot::Pipeline(r)) = buffer.get(&ReportKind::Pipeline) {
            payload.pipeline_report = Some(r.clone());
        }
        if let Some(ReportSnapshot::RevocationList(r)) = buffer.get(&ReportKind::RevocationList) {
            payload.revocation_report = Some(r.clone());
        }
        if let Some(ReportSnapshot::CommandStatus(r)) = buffer.remove(&ReportKind::CommandStatus)
        {
            payload.command_status_report = Some(r);
        }
        payload
    }

    /// Stop the polling tasks. Called once by the owning lifecycle;
    /// later calls are no-ops.
    pub fn shutdown(&self) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stopping.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slate_common::command::{CommandKind, CommandStatus};
    use crate::storage::InMemoryEngine;

    fn full_manager(ctx: Arc<StateContext>) -> (ReportManager, Arc<EngineSlot>) {
        let slot = Arc::new(EngineSlot::new());
        let engine = InMemoryEngine::new();
        engine.insert_container(11, 100, 2);
        slot.publish(engine.handle()).expect("publish");

        let volume_health = Arc::new(VolumeHealthTracker::new(0));
        let operational = Arc::new(OperationalStateHolder::new());
        let pipelines = Arc::new(PipelineTracker::new());
        pipelines.add("pipeline-a");
        let revocations = Arc::new(InMemoryRevocationList::new());
        revocations.set_processed_sequence(4);

        let interval = Duration::from_secs(60);
        let manager = ReportManager::new(
            "node-1",
            vec![
                Arc::new(NodeReportPublisher::new(
                    Arc::clone(&slot),
                    volume_health,
                    operational,
                    interval,
                )),
                Arc::new(ContainerReportPublisher::new(Arc::clone(&slot), interval)),
                Arc::new(PipelineReportPublisher::new(pipelines, interval)),
                Arc::new(CommandStatusReportPublisher::new(ctx, interval)),
                Arc::new(RevocationListPublisher::new(revocations, interval)),
            ],
        );
        (manager, slot)
    }

    #[tokio::test]
    async fn assemble_bundles_every_kind() {
        let ctx = Arc::new(StateContext::new(Duration::from_millis(100)));
        ctx.record_command_status(1, CommandKind::CloseContainer, CommandStatus::Executed);
        let (manager, _slot) = full_manager(ctx);
        manager.init();

        let payload = manager.assemble();
        assert_eq!(payload.node_id, "node-1");
        assert!(payload.node_report.is_some());
        let containers = payload.container_report.expect("container report");
        assert_eq!(containers.replicas.len(), 1);
        assert_eq!(
            payload.pipeline_report.expect("pipeline report").pipeline_ids,
            vec!["pipeline-a".to_string()]
        );
        assert_eq!(
            payload
                .revocation_report
                .expect("revocation report")
                .processed_sequence,
            4
        );
        assert_eq!(
            payload
                .command_status_report
                .expect("command status report")
                .entries
                .len(),
            1
        );
        manager.shutdown();
    }

    #[tokio::test]
    async fn command_statuses_ride_exactly_one_payload() {
        let ctx = Arc::new(StateContext::new(Duration::from_millis(100)));
        let (manager, _slot) = full_manager(Arc::clone(&ctx));
        manager.init();

        ctx.record_command_status(7, CommandKind::DeleteContainer, CommandStatus::Failed);
        manager.refresh_now();
        let first = manager.assemble();
        assert_eq!(
            first.command_status_report.expect("entries").entries.len(),
            1
        );

        // Nothing new: the next payload has no stale outcomes.
        manager.refresh_now();
        let second = manager.assemble();
        let entries = second.command_status_report.unwrap_or_default().entries;
        assert!(entries.is_empty(), "stale outcomes must not be re-sent");
        manager.shutdown();
    }

    #[tokio::test]
    async fn init_and_shutdown_are_latched() {
        let ctx = Arc::new(StateContext::new(Duration::from_millis(100)));
        let (manager, _slot) = full_manager(ctx);
        manager.init();
        manager.init();
        assert_eq!(manager.tasks.lock().len(), 5, "no duplicate polling tasks");
        manager.shutdown();
        manager.shutdown();
        assert!(manager.tasks.lock().is_empty());
    }
}
