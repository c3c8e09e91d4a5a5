//! State Machine Core
//!
//! [`NodeStateMachine`] is the top-level orchestrator of the agent. It
//! owns the lifecycle state, runs the heartbeat timing loop, hosts the
//! dedicated command-processing task and drives shutdown and failure
//! escalation. Everything else (dispatcher, replication supervisor,
//! report manager, connection manager, upgrade finalizer, pause
//! monitor) is composed here.
//!
//! ## Execution Model
//!
//! One heartbeat cycle per interval: compute the deadline, drive every
//! controller session concurrently within the interval as a timeout
//! budget, then sleep until the deadline. The sleep is interruptible:
//! `trigger_heartbeat()` wakes it early without altering the next
//! deadline computation, and a stored trigger produces at most one
//! early cycle. Cycles never overlap.
//!
//! ## Failure Policy
//!
//! A failed cycle is logged and the loop continues; only the fatal flag
//! (or exceeding the volume-failure tolerance) escalates to a full
//! process stop through [`NodeStopService`]. Shutdown is always
//! reachable and idempotent: every teardown step runs even if an
//! earlier one fails, and in-flight work gets a bounded grace period
//! before forced cancellation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use slate_common::command::CommandStatus;
use slate_common::config::AgentConfig;
use slate_common::lifecycle::NodeLifecycleState;

use crate::command_handlers::{
    CloseContainerHandler, DeleteBlocksHandler, DeleteContainerHandler, FinalizeUpgradeHandler,
    RefreshVolumeUsageHandler, ReplicateContainerHandler, SetNodeOperationalStateHandler,
};
use crate::connection::{ConnectionManager, ControllerEndpoint, SessionStats};
use crate::context::{ExitReason, StateContext};
use crate::dispatcher::{CommandDispatcher, DuplicateHandlerError};
use crate::metrics::NodeAgentMetrics;
use crate::pause_monitor::{PauseMonitor, PauseMonitorConfig};
use crate::replication::{ContainerReplicator, MeasuredReplicator, ReplicationSupervisor};
use crate::reports::{
    CommandStatusReportPublisher, ContainerReportPublisher, NodeReportPublisher,
    OperationalStateHolder, PipelineReportPublisher, PipelineTracker, ReportManager,
    ReportPublisher, RevocationListPublisher, RevocationSource,
};
use crate::storage::{EngineSlot, VolumeHealthTracker};
use crate::supervised::SupervisedTask;
use crate::upgrade::{LayoutVersionStore, UpgradeError, UpgradeFinalizer, UpgradeStatus};

/// Hook into the hosting process, used for fatal escalation: the agent
/// never exits the process itself, it asks its host to stop it.
pub trait NodeStopService: Send + Sync {
    fn stop_service(&self);
}

pub struct NodeStateMachine {
    config: AgentConfig,
    ctx: Arc<StateContext>,
    metrics: Arc<NodeAgentMetrics>,
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<CommandDispatcher>,
    reports: Arc<ReportManager>,
    supervisor: Arc<ReplicationSupervisor>,
    upgrade: Arc<UpgradeFinalizer>,
    pause_monitor: Arc<PauseMonitor>,
    engine: Arc<EngineSlot>,
    volume_health: Arc<VolumeHealthTracker>,
    operational_state: Arc<OperationalStateHolder>,
    pipelines: Arc<PipelineTracker>,
    stop_service: Arc<dyn NodeStopService>,
    commands_handled: Arc<AtomicU64>,
    /// Deadline of the next heartbeat cycle; the command processor
    /// sleeps until shortly past it when the queue is empty.
    next_heartbeat: Arc<Mutex<Instant>>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    cmd_task: Mutex<Option<Arc<SupervisedTask>>>,
    closed: AtomicBool,
}

impl NodeStateMachine {
    /// Compose the agent. The engine slot may still be unpublished at
    /// this point; handlers resolve it per command.
    pub fn new(
        config: AgentConfig,
        engine: Arc<EngineSlot>,
        replicator: Arc<dyn ContainerReplicator>,
        endpoints: Vec<Arc<dyn ControllerEndpoint>>,
        layout_store: Arc<dyn LayoutVersionStore>,
        revocation: Arc<dyn RevocationSource>,
        stop_service: Arc<dyn NodeStopService>,
    ) -> Result<Arc<Self>, DuplicateHandlerError> {
        let metrics = Arc::new(NodeAgentMetrics::new());
        let ctx = Arc::new(StateContext::new(config.heartbeat_interval()));
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let measured = Arc::new(MeasuredReplicator::new(replicator, Arc::clone(&metrics)));
        let supervisor = Arc::new(ReplicationSupervisor::new(
            config.replication_workers,
            measured,
            Arc::clone(&metrics),
        ));
        let volume_health = Arc::new(VolumeHealthTracker::new(config.failed_volumes_tolerated));
        let operational_state = Arc::new(OperationalStateHolder::new());
        let pipelines = Arc::new(PipelineTracker::new());
        let upgrade = Arc::new(UpgradeFinalizer::new(layout_store));

        // Adding a handler here is all it takes to serve a new command
        // kind.
        let dispatcher = Arc::new(
            CommandDispatcher::builder(Arc::clone(&metrics))
                .add_handler(Arc::new(CloseContainerHandler::new(Arc::clone(&engine))))
                .add_handler(Arc::new(DeleteBlocksHandler::new(
                    Arc::clone(&engine),
                    Arc::clone(&ctx),
                    config.block_delete_workers,
                    config.block_delete_queue_limit,
                )))
                .add_handler(Arc::new(ReplicateContainerHandler::new(Arc::clone(
                    &supervisor,
                ))))
                .add_handler(Arc::new(DeleteContainerHandler::new(
                    Arc::clone(&engine),
                    Arc::clone(&ctx),
                    config.container_delete_workers,
                )))
                .add_handler(Arc::new(SetNodeOperationalStateHandler::new(Arc::clone(
                    &operational_state,
                ))))
                .add_handler(Arc::new(FinalizeUpgradeHandler::new(Arc::clone(&upgrade))))
                .add_handler(Arc::new(RefreshVolumeUsageHandler::new(Arc::clone(
                    &engine,
                ))))
                .build()?,
        );

        let publisher_interval = config.heartbeat_interval();
        let publishers: Vec<Arc<dyn ReportPublisher>> = vec![
            Arc::new(NodeReportPublisher::new(
                Arc::clone(&engine),
                Arc::clone(&volume_health),
                Arc::clone(&operational_state),
                publisher_interval,
            )),
            Arc::new(ContainerReportPublisher::new(
                Arc::clone(&engine),
                publisher_interval,
            )),
            Arc::new(PipelineReportPublisher::new(
                Arc::clone(&pipelines),
                publisher_interval,
            )),
            Arc::new(CommandStatusReportPublisher::new(
                Arc::clone(&ctx),
                publisher_interval,
            )),
            Arc::new(RevocationListPublisher::new(revocation, publisher_interval)),
        ];
        let reports = Arc::new(ReportManager::new(node_id, publishers));

        let connection = Arc::new(ConnectionManager::new(endpoints, Arc::clone(&metrics)));
        let pause_monitor = Arc::new(PauseMonitor::new(
            PauseMonitorConfig::default(),
            Arc::clone(&metrics),
        ));

        let machine = Arc::new(Self {
            config,
            ctx,
            metrics,
            connection,
            dispatcher,
            reports,
            supervisor,
            upgrade,
            pause_monitor,
            engine,
            volume_health,
            operational_state,
            pipelines,
            stop_service,
            commands_handled: Arc::new(AtomicU64::new(0)),
            next_heartbeat: Arc::new(Mutex::new(Instant::now())),
            loop_task: Mutex::new(None),
            cmd_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        // Persistent volume loss escalates through the same fatal stop
        // path as the in-loop fatal flag, independent of the loop.
        {
            let weak = Arc::downgrade(&machine);
            machine.volume_health.set_fatal_hook(move || {
                if let Some(machine) = weak.upgrade() {
                    machine.handle_fatal_volume_failures();
                }
            });
        }

        Ok(machine)
    }

    // ════════════════════════════════════════════════════════════════════
    // STARTUP & MAIN LOOP
    // ════════════════════════════════════════════════════════════════════

    /// Run the agent to completion: upgrade gating, report manager,
    /// command processor, pause monitor, then the heartbeat loop until
    /// the lifecycle reaches shutdown.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let status = self
            .upgrade
            .run_prefinalize_actions()
            .context("upgrade pre-finalization failed")?;
        info!(upgrade_state = %status.state, "upgrade pre-finalization complete");

        self.reports.init();
        self.supervisor.start();
        self.start_command_processor();
        self.pause_monitor.start();

        if let Err(e) = self.ctx.set_state(NodeLifecycleState::Running) {
            // A shutdown that raced startup wins; anything else is a bug
            // worth seeing in the logs.
            warn!(error = %e, "could not enter running state");
            if self.ctx.state().is_terminal() {
                return Ok(());
            }
        }

        self.run_heartbeat_loop().await;
        Ok(())
    }

    async fn run_heartbeat_loop(self: &Arc<Self>) {
        while self.ctx.state() != NodeLifecycleState::Shutdown {
            let cycle = self.ctx.begin_cycle();
            self.metrics.record_heartbeat_cycle();
            debug!(cycle, "executing heartbeat cycle");

            let interval = self.ctx.heartbeat_interval();
            let deadline = Instant::now() + interval;
            *self.next_heartbeat.lock() = deadline;

            // A single bad cycle must not terminate the agent.
            if let Err(e) = self.execute_cycle(interval).await {
                error!(cycle, error = %e, "unable to finish cycle execution");
            }

            if self.ctx.shutdown_on_error() {
                error!("fatal condition raised, stopping the node agent");
                self.ctx.record_exit_reason(ExitReason::Fatal);
                self.ctx.force_shutdown_state();
                self.stop_service.stop_service();
                break;
            }

            if Instant::now() < deadline {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = self.ctx.heartbeat_wakeup() => {
                        debug!("immediate heartbeat triggered");
                    }
                    _ = self.ctx.shutdown_wakeup() => {}
                }
            }
        }
        info!("heartbeat loop exited");
    }

    /// One execution cycle: assemble the report payload and drive every
    /// controller session within the cycle's timeout budget.
    async fn execute_cycle(&self, cycle_timeout: Duration) -> anyhow::Result<()> {
        let payload = self.reports.assemble();
        self.connection
            .drive_cycle(&self.ctx, &payload, cycle_timeout)
            .await;
        Ok(())
    }

    /// Spawn the supervised, single-worker command processor. Commands
    /// arrive in controller order and must be applied in that order, so
    /// there is exactly one worker; if it crashes it is respawned and
    /// command processing is never permanently lost.
    fn start_command_processor(&self) {
        let ctx = Arc::clone(&self.ctx);
        let dispatcher = Arc::clone(&self.dispatcher);
        let handled = Arc::clone(&self.commands_handled);
        let metrics = Arc::clone(&self.metrics);
        let next_heartbeat = Arc::clone(&self.next_heartbeat);

        let task = SupervisedTask::spawn("command-processor", move || {
            let ctx = Arc::clone(&ctx);
            let dispatcher = Arc::clone(&dispatcher);
            let handled = Arc::clone(&handled);
            let metrics = Arc::clone(&metrics);
            let next_heartbeat = Arc::clone(&next_heartbeat);
            async move {
                while ctx.state() != NodeLifecycleState::Shutdown {
                    match ctx.next_command() {
                        Some(command) => {
                            let status = dispatcher.dispatch(&command).await;
                            // Pending means an internal pool owns the final
                            // outcome; don't clobber a result that may have
                            // already landed.
                            if status != CommandStatus::Pending {
                                ctx.record_command_status(command.id, command.kind(), status);
                            }
                            handled.fetch_add(1, Ordering::AcqRel);
                            metrics.record_command_handled();
                        }
                        None => {
                            // Idle until shortly past the next heartbeat,
                            // when new commands may have arrived.
                            let deadline = *next_heartbeat.lock() + Duration::from_secs(1);
                            tokio::select! {
                                _ = tokio::time::sleep_until(deadline) => {}
                                _ = ctx.shutdown_wakeup() => {}
                            }
                        }
                    }
                }
                debug!("command processor exited");
            }
        });
        *self.cmd_task.lock() = Some(Arc::new(task));
    }

    /// Spawn `start()` in the background and return immediately.
    pub fn start_daemon(self: &Arc<Self>) {
        let machine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!("node agent started");
            if let Err(e) = machine.start().await {
                error!(error = %e, "unable to start the node state machine");
            }
        });
        *self.loop_task.lock() = Some(handle);
    }

    // ════════════════════════════════════════════════════════════════════
    // TRIGGERS & ESCALATION
    // ════════════════════════════════════════════════════════════════════

    /// Request an out-of-band heartbeat: wakes the loop's sleep without
    /// touching the next deadline computation. At most one cycle runs
    /// per trigger.
    pub fn trigger_heartbeat(&self) {
        if self.is_daemon_started() {
            self.ctx.trigger_heartbeat();
        }
    }

    /// Fatal escalation for persistent volume loss: records the fatal
    /// exit and asks the hosting process to stop. The host reacts with
    /// the ordered `stop_daemon` sequence, so the loop's own fatal-flag
    /// path is not raised here, so the stop hook fires exactly once.
    pub fn handle_fatal_volume_failures(&self) {
        error!(
            failed = self.volume_health.failed_volume_count(),
            tolerated = self.volume_health.tolerated(),
            "shutting down: too many failed volumes"
        );
        self.ctx.record_exit_reason(ExitReason::Fatal);
        self.stop_service.stop_service();
    }

    // ════════════════════════════════════════════════════════════════════
    // SHUTDOWN
    // ════════════════════════════════════════════════════════════════════

    /// Graceful, ordered, idempotent shutdown of the whole agent.
    pub async fn stop_daemon(&self) {
        self.ctx.record_exit_reason(ExitReason::Graceful);
        self.ctx.set_graceful_shutdown();
        self.supervisor.stop(self.config.shutdown_grace()).await;
        self.ctx.force_shutdown_state();
        self.reports.shutdown();
        self.close().await;
        info!("node agent stopped");
    }

    /// Release every resource. Each step runs even if an earlier one
    /// fails; in-flight tasks get the configured grace period before
    /// forced cancellation. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let grace = self.config.shutdown_grace();

        self.ctx.force_shutdown_state();
        self.ctx.wake_all();
        self.supervisor.stop(grace).await;
        self.reports.shutdown();

        let loop_handle = self.loop_task.lock().take();
        if let Some(handle) = loop_handle {
            let abort = handle.abort_handle();
            if timeout(grace, handle).await.is_err() {
                error!("heartbeat loop did not stop in time, aborting");
                abort.abort();
            }
        }
        let cmd_task = self.cmd_task.lock().clone();
        if let Some(task) = cmd_task {
            if timeout(grace, task.join()).await.is_err() {
                error!("command processor did not stop in time, aborting");
                task.abort();
            }
        }

        self.connection.close().await;
        self.pause_monitor.stop();
        self.dispatcher.stop().await;
    }

    /// Wait for the heartbeat loop and the command processor to finish.
    pub async fn join(&self) {
        let handle = self.loop_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let cmd_task = self.cmd_task.lock().clone();
        if let Some(task) = cmd_task {
            task.join().await;
        }
    }

    // ════════════════════════════════════════════════════════════════════
    // UPGRADE SURFACE
    // ════════════════════════════════════════════════════════════════════

    pub fn finalize_upgrade(&self) -> Result<UpgradeStatus, UpgradeError> {
        self.upgrade.finalize()
    }

    pub fn query_upgrade_status(&self) -> Result<UpgradeStatus, UpgradeError> {
        self.upgrade.report_status()
    }

    // ════════════════════════════════════════════════════════════════════
    // OBSERVABILITY & TEST ACCESSORS
    // ════════════════════════════════════════════════════════════════════

    pub fn lifecycle_state(&self) -> NodeLifecycleState {
        self.ctx.state()
    }

    pub fn execution_count(&self) -> u64 {
        self.ctx.execution_count()
    }

    pub fn commands_handled(&self) -> u64 {
        self.commands_handled.load(Ordering::Acquire)
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.ctx.exit_reason()
    }

    pub fn is_daemon_started(&self) -> bool {
        self.ctx.execution_count() > 0
    }

    pub fn is_daemon_stopped(&self) -> bool {
        let loop_done = match self.loop_task.lock().as_ref() {
            Some(handle) => handle.is_finished(),
            None => true,
        };
        let cmd_done = match self.cmd_task.lock().as_ref() {
            Some(task) => task.is_finished(),
            None => true,
        };
        loop_done && cmd_done && self.ctx.state() == NodeLifecycleState::Shutdown
    }

    pub fn context(&self) -> Arc<StateContext> {
        Arc::clone(&self.ctx)
    }

    pub fn metrics(&self) -> Arc<NodeAgentMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn dispatcher(&self) -> Arc<CommandDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn replication_supervisor(&self) -> Arc<ReplicationSupervisor> {
        Arc::clone(&self.supervisor)
    }

    pub fn volume_health(&self) -> Arc<VolumeHealthTracker> {
        Arc::clone(&self.volume_health)
    }

    pub fn operational_state(&self) -> Arc<OperationalStateHolder> {
        Arc::clone(&self.operational_state)
    }

    pub fn pipelines(&self) -> Arc<PipelineTracker> {
        Arc::clone(&self.pipelines)
    }

    pub fn engine(&self) -> Arc<EngineSlot> {
        Arc::clone(&self.engine)
    }

    pub fn session_stats(&self) -> Vec<SessionStats> {
        self.connection.session_stats()
    }

    pub fn node_id(&self) -> &str {
        self.reports.node_id()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}
