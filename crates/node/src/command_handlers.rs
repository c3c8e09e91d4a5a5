//! Command Handlers
//!
//! One handler per controller command kind, registered with the
//! dispatcher at startup. Handlers that front slow storage work
//! (container deletion, block deletion) run it on their own bounded
//! pools and report `Pending` from `handle`, recording the final
//! outcome in the status ledger when the pooled work completes; the
//! single command-processor worker is never blocked behind engine IO it
//! does not need to order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use slate_common::command::{CommandKind, CommandStatus, ControllerCommand};

use crate::context::StateContext;
use crate::dispatcher::{CommandHandler, HandlerError};
use crate::replication::{ReplicationJob, ReplicationSupervisor};
use crate::reports::OperationalStateHolder;
use crate::storage::EngineSlot;
use crate::upgrade::UpgradeFinalizer;

// ════════════════════════════════════════════════════════════════════════════
// REPLICATE CONTAINER
// ════════════════════════════════════════════════════════════════════════════

/// Submits replication work to the supervisor. The command is reported
/// `Pending` once queued; progress is visible through the replication
/// counters rather than per-command status.
pub struct ReplicateContainerHandler {
    supervisor: Arc<ReplicationSupervisor>,
}

impl ReplicateContainerHandler {
    pub fn new(supervisor: Arc<ReplicationSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl CommandHandler for ReplicateContainerHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::ReplicateContainer
    }

    async fn handle(&self, command: &ControllerCommand) -> Result<CommandStatus, HandlerError> {
        let slate_common::command::CommandPayload::ReplicateContainer {
            container_id,
            sources,
        } = &command.payload
        else {
            return Err(HandlerError::UnexpectedPayload {
                expected: self.kind(),
                got: command.kind(),
            });
        };
        let accepted = self.supervisor.add_task(ReplicationJob {
            container_id: *container_id,
            sources: sources.clone(),
        });
        if !accepted {
            // Already queued/in flight; the earlier submission covers it.
            debug!(container_id = *container_id, "replication already underway");
        }
        Ok(CommandStatus::Pending)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// DELETE CONTAINER
// ════════════════════════════════════════════════════════════════════════════

/// Deletes container replicas on a bounded pool of its own.
pub struct DeleteContainerHandler {
    engine: Arc<EngineSlot>,
    ctx: Arc<StateContext>,
    permits: Arc<Semaphore>,
}

impl DeleteContainerHandler {
    pub fn new(engine: Arc<EngineSlot>, ctx: Arc<StateContext>, workers: usize) -> Self {
        Self {
            engine,
            ctx,
            permits: Arc::new(Semaphore::new(workers)),
        }
    }
}

#[async_trait]
impl CommandHandler for DeleteContainerHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::DeleteContainer
    }

    async fn handle(&self, command: &ControllerCommand) -> Result<CommandStatus, HandlerError> {
        let slate_common::command::CommandPayload::DeleteContainer { container_id, force } =
            command.payload
        else {
            return Err(HandlerError::UnexpectedPayload {
                expected: self.kind(),
                got: command.kind(),
            });
        };
        let engine = self.engine.require().map_err(|_| HandlerError::EngineUnavailable)?;
        let ctx = Arc::clone(&self.ctx);
        let permits = Arc::clone(&self.permits);
        let (id, kind) = (command.id, command.kind());
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                // Pool closed during shutdown; the controller will reissue.
                ctx.record_command_status(id, kind, CommandStatus::Failed);
                return;
            };
            let status = match engine.controller.delete_container(container_id, force).await {
                Ok(()) => CommandStatus::Executed,
                Err(e) => {
                    warn!(container_id, error = %e, "container deletion failed");
                    CommandStatus::Failed
                }
            };
            ctx.record_command_status(id, kind, status);
        });
        Ok(CommandStatus::Pending)
    }

    async fn stop(&self) {
        self.permits.close();
    }
}

// ════════════════════════════════════════════════════════════════════════════
// DELETE BLOCKS
// ════════════════════════════════════════════════════════════════════════════

/// Deletes block batches on a bounded pool with a queue cap.
pub struct DeleteBlocksHandler {
    engine: Arc<EngineSlot>,
    ctx: Arc<StateContext>,
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    queue_limit: usize,
}

impl DeleteBlocksHandler {
    pub fn new(
        engine: Arc<EngineSlot>,
        ctx: Arc<StateContext>,
        workers: usize,
        queue_limit: usize,
    ) -> Self {
        Self {
            engine,
            ctx,
            permits: Arc::new(Semaphore::new(workers)),
            queued: Arc::new(AtomicUsize::new(0)),
            queue_limit,
        }
    }

    pub fn queued_count(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

#[async_trait]
impl CommandHandler for DeleteBlocksHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::DeleteBlocks
    }

    async fn handle(&self, command: &ControllerCommand) -> Result<CommandStatus, HandlerError> {
        let slate_common::command::CommandPayload::DeleteBlocks {
            container_id,
            block_ids,
        } = &command.payload
        else {
            return Err(HandlerError::UnexpectedPayload {
                expected: self.kind(),
                got: command.kind(),
            });
        };
        if self.queued.load(Ordering::Acquire) >= self.queue_limit {
            return Err(HandlerError::QueueFull {
                kind: self.kind(),
                limit: self.queue_limit,
            });
        }
        let engine = self.engine.require().map_err(|_| HandlerError::EngineUnavailable)?;
        self.queued.fetch_add(1, Ordering::AcqRel);

        let ctx = Arc::clone(&self.ctx);
        let permits = Arc::clone(&self.permits);
        let queued = Arc::clone(&self.queued);
        let (id, kind) = (command.id, command.kind());
        let container_id = *container_id;
        let block_ids = block_ids.clone();
        tokio::spawn(async move {
            let status = match permits.acquire().await {
                Ok(_permit) => {
                    match engine.controller.delete_blocks(container_id, &block_ids).await {
                        Ok(deleted) => {
                            debug!(container_id, deleted, "block batch deleted");
                            CommandStatus::Executed
                        }
                        Err(e) => {
                            warn!(container_id, error = %e, "block deletion failed");
                            CommandStatus::Failed
                        }
                    }
                }
                Err(_) => CommandStatus::Failed,
            };
            ctx.record_command_status(id, kind, status);
            queued.fetch_sub(1, Ordering::AcqRel);
        });
        Ok(CommandStatus::Pending)
    }

    async fn stop(&self) {
        self.permits.close();
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CLOSE CONTAINER
// ════════════════════════════════════════════════════════════════════════════

pub struct CloseContainerHandler {
    engine: Arc<EngineSlot>,
}

impl CloseContainerHandler {
    pub fn new(engine: Arc<EngineSlot>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl CommandHandler for CloseContainerHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::CloseContainer
    }

    async fn handle(&self, command: &ControllerCommand) -> Result<CommandStatus, HandlerError> {
        let slate_common::command::CommandPayload::CloseContainer { container_id } =
            command.payload
        else {
            return Err(HandlerError::UnexpectedPayload {
                expected: self.kind(),
                got: command.kind(),
            });
        };
        let engine = self.engine.require().map_err(|_| HandlerError::EngineUnavailable)?;
        engine.controller.close_container(container_id).await?;
        Ok(CommandStatus::Executed)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// FINALIZE UPGRADE
// ════════════════════════════════════════════════════════════════════════════

pub struct FinalizeUpgradeHandler {
    finalizer: Arc<UpgradeFinalizer>,
}

impl FinalizeUpgradeHandler {
    pub fn new(finalizer: Arc<UpgradeFinalizer>) -> Self {
        Self { finalizer }
    }
}

#[async_trait]
impl CommandHandler for FinalizeUpgradeHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::FinalizeUpgrade
    }

    async fn handle(&self, command: &ControllerCommand) -> Result<CommandStatus, HandlerError> {
        if command.kind() != self.kind() {
            return Err(HandlerError::UnexpectedPayload {
                expected: self.kind(),
                got: command.kind(),
            });
        }
        let status = self.finalizer.finalize()?;
        debug!(state = %status.state, "upgrade finalization requested by controller");
        Ok(CommandStatus::Executed)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// REFRESH VOLUME USAGE
// ════════════════════════════════════════════════════════════════════════════

pub struct RefreshVolumeUsageHandler {
    engine: Arc<EngineSlot>,
}

impl RefreshVolumeUsageHandler {
    pub fn new(engine: Arc<EngineSlot>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl CommandHandler for RefreshVolumeUsageHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::RefreshVolumeUsage
    }

    async fn handle(&self, command: &ControllerCommand) -> Result<CommandStatus, HandlerError> {
        if command.kind() != self.kind() {
            return Err(HandlerError::UnexpectedPayload {
                expected: self.kind(),
                got: command.kind(),
            });
        }
        let engine = self.engine.require().map_err(|_| HandlerError::EngineUnavailable)?;
        engine.container_set.refresh_volume_usage();
        Ok(CommandStatus::Executed)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// SET NODE OPERATIONAL STATE
// ════════════════════════════════════════════════════════════════════════════

pub struct SetNodeOperationalStateHandler {
    holder: Arc<OperationalStateHolder>,
}

impl SetNodeOperationalStateHandler {
    pub fn new(holder: Arc<OperationalStateHolder>) -> Self {
        Self { holder }
    }
}

#[async_trait]
impl CommandHandler for SetNodeOperationalStateHandler {
    fn kind(&self) -> CommandKind {
        CommandKind::SetNodeOperationalState
    }

    async fn handle(&self, command: &ControllerCommand) -> Result<CommandStatus, HandlerError> {
        let slate_common::command::CommandPayload::SetNodeOperationalState {
            state,
            expiry_epoch_secs,
        } = command.payload
        else {
            return Err(HandlerError::UnexpectedPayload {
                expected: self.kind(),
                got: command.kind(),
            });
        };
        self.holder.set(state, expiry_epoch_secs);
        debug!(%state, expiry_epoch_secs, "operational state updated");
        Ok(CommandStatus::Executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slate_common::command::{CommandPayload, NodeOperationalState};
    use std::time::{Duration, Instant};

    use crate::metrics::NodeAgentMetrics;
    use crate::replication::{ContainerReplicator, ReplicationError};
    use crate::storage::{ContainerController, ContainerSet, InMemoryEngine};
    use crate::upgrade::InMemoryLayoutStore;

    fn published_engine() -> (Arc<EngineSlot>, Arc<InMemoryEngine>) {
        let slot = Arc::new(EngineSlot::new());
        let engine = InMemoryEngine::new();
        slot.publish(engine.handle()).expect("publish");
        (slot, engine)
    }

    fn ctx() -> Arc<StateContext> {
        Arc::new(StateContext::new(Duration::from_millis(100)))
    }

    async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn close_container_handler_closes() {
        let (slot, engine) = published_engine();
        engine.create_container(4).await.expect("create");
        let handler = CloseContainerHandler::new(slot);
        let cmd = ControllerCommand::new(1, CommandPayload::CloseContainer { container_id: 4 });
        let status = handler.handle(&cmd).await.expect("handle");
        assert_eq!(status, CommandStatus::Executed);
        assert_eq!(engine.op_log().last().map(String::as_str), Some("close:4"));
    }

    #[tokio::test]
    async fn delete_container_handler_records_final_outcome() {
        let (slot, engine) = published_engine();
        engine.create_container(6).await.expect("create");
        engine.close_container(6).await.expect("close");

        let ctx = ctx();
        let handler = DeleteContainerHandler::new(slot, Arc::clone(&ctx), 2);
        let cmd = ControllerCommand::new(
            2,
            CommandPayload::DeleteContainer {
                container_id: 6,
                force: false,
            },
        );
        let status = handler.handle(&cmd).await.expect("handle");
        assert_eq!(status, CommandStatus::Pending);

        assert!(
            wait_until(Duration::from_secs(2), || !engine.has_container(6)).await
        );
        // The pooled task records the final outcome just after deleting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let entries = ctx.drain_command_statuses();
        assert!(entries
            .iter()
            .any(|e| e.command_id == 2 && e.status == CommandStatus::Executed));
    }

    #[tokio::test]
    async fn delete_blocks_queue_cap_is_enforced() {
        let (slot, _engine) = published_engine();
        let handler = DeleteBlocksHandler::new(slot, ctx(), 1, 0);
        let cmd = ControllerCommand::new(
            3,
            CommandPayload::DeleteBlocks {
                container_id: 1,
                block_ids: vec![1],
            },
        );
        let err = handler.handle(&cmd).await.unwrap_err();
        assert!(matches!(err, HandlerError::QueueFull { limit: 0, .. }));
    }

    #[tokio::test]
    async fn replicate_handler_queues_to_supervisor() {
        struct NullReplicator;
        #[async_trait]
        impl ContainerReplicator for NullReplicator {
            async fn replicate(&self, _job: &ReplicationJob) -> Result<u64, ReplicationError> {
                Ok(0)
            }
        }

        let metrics = Arc::new(NodeAgentMetrics::new());
        let supervisor = Arc::new(ReplicationSupervisor::new(
            1,
            Arc::new(NullReplicator),
            Arc::clone(&metrics),
        ));
        let handler = ReplicateContainerHandler::new(Arc::clone(&supervisor));
        let cmd = ControllerCommand::new(
            4,
            CommandPayload::ReplicateContainer {
                container_id: 9,
                sources: vec!["10.0.0.3:9859".to_string()],
            },
        );
        let status = handler.handle(&cmd).await.expect("handle");
        assert_eq!(status, CommandStatus::Pending);
        assert_eq!(metrics.replication_requested(), 1);
        supervisor.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn refresh_and_operational_state_handlers() {
        let (slot, engine) = published_engine();
        let refresh = RefreshVolumeUsageHandler::new(slot);
        let cmd = ControllerCommand::new(5, CommandPayload::RefreshVolumeUsage);
        assert_eq!(
            refresh.handle(&cmd).await.expect("handle"),
            CommandStatus::Executed
        );
        assert_eq!(engine.usage_refreshes(), 1);

        let holder = Arc::new(OperationalStateHolder::new());
        let set_state = SetNodeOperationalStateHandler::new(Arc::clone(&holder));
        let cmd = ControllerCommand::new(
            6,
            CommandPayload::SetNodeOperationalState {
                state: NodeOperationalState::Decommissioning,
                expiry_epoch_secs: 0,
            },
        );
        assert_eq!(
            set_state.handle(&cmd).await.expect("handle"),
            CommandStatus::Executed
        );
        assert_eq!(holder.get().0, NodeOperationalState::Decommissioning);
    }

    #[tokio::test]
    async fn finalize_upgrade_handler_completes_pending_upgrade() {
        let finalizer = Arc::new(UpgradeFinalizer::new(Arc::new(
            InMemoryLayoutStore::at_version(1),
        )));
        finalizer.run_prefinalize_actions().expect("prefinalize");
        let handler = FinalizeUpgradeHandler::new(Arc::clone(&finalizer));
        let cmd = ControllerCommand::new(7, CommandPayload::FinalizeUpgrade);
        assert_eq!(
            handler.handle(&cmd).await.expect("handle"),
            CommandStatus::Executed
        );
        assert_eq!(
            finalizer.report_status().expect("status").state,
            crate::upgrade::UpgradeState::Finalized
        );
    }

    #[tokio::test]
    async fn wrong_payload_is_rejected() {
        let (slot, _engine) = published_engine();
        let handler = CloseContainerHandler::new(slot);
        let cmd = ControllerCommand::new(8, CommandPayload::RefreshVolumeUsage);
        let err = handler.handle(&cmd).await.unwrap_err();
        assert!(matches!(err, HandlerError::UnexpectedPayload { .. }));
    }
}
