//! Command Dispatcher
//!
//! Routes each dequeued controller command to the single handler
//! registered for its kind. The routing table is built once at startup
//! by [`DispatcherBuilder`] and is immutable afterwards; registration
//! after build does not exist by construction.
//!
//! Dispatch is invoked synchronously from the command processor's single
//! worker, so no two commands ever execute concurrently. A command whose
//! kind has no registered handler is an error condition: it is logged,
//! counted, recorded as failed and dropped, never allowed to crash the
//! worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, warn};

use slate_common::command::{CommandKind, CommandStatus, ControllerCommand};

use crate::metrics::NodeAgentMetrics;

/// Failures a handler can report back to the dispatcher.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler for {expected} received {got} payload")]
    UnexpectedPayload {
        expected: CommandKind,
        got: CommandKind,
    },
    #[error("storage engine not published yet")]
    EngineUnavailable,
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
    #[error(transparent)]
    Upgrade(#[from] crate::upgrade::UpgradeError),
    #[error("command queue for {kind} is full ({limit} pending)")]
    QueueFull { kind: CommandKind, limit: usize },
}

/// One handler per command kind. Handlers own whatever resources they
/// need (engine handles, worker pools) and release them in `stop`.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// The single command kind this handler serves.
    fn kind(&self) -> CommandKind;

    /// Execute one command. Returning `CommandStatus::Pending` means the
    /// work was accepted by an internal pool; the handler is then
    /// responsible for recording the final outcome in the status ledger.
    async fn handle(&self, command: &ControllerCommand) -> Result<CommandStatus, HandlerError>;

    /// Release handler-owned resources. Called once during shutdown.
    async fn stop(&self) {}
}

/// Duplicate registration detected while building the routing table.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("duplicate handler registered for command kind {0}")]
pub struct DuplicateHandlerError(pub CommandKind);

struct HandlerEntry {
    handler: Arc<dyn CommandHandler>,
    invocations: AtomicU64,
    failures: AtomicU64,
}

pub struct DispatcherBuilder {
    handlers: Vec<Arc<dyn CommandHandler>>,
    metrics: Arc<NodeAgentMetrics>,
}

impl DispatcherBuilder {
    pub fn new(metrics: Arc<NodeAgentMetrics>) -> Self {
        Self {
            handlers: Vec::new(),
            metrics,
        }
    }

    pub fn add_handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Freeze the routing table. Fails on duplicate kinds.
    pub fn build(self) -> Result<CommandDispatcher, DuplicateHandlerError> {
        let mut table: HashMap<CommandKind, HandlerEntry> = HashMap::new();
        for handler in self.handlers {
            let kind = handler.kind();
            if table.contains_key(&kind) {
                return Err(DuplicateHandlerError(kind));
            }
            table.insert(
                kind,
                HandlerEntry {
                    handler,
                    invocations: AtomicU64::new(0),
                    failures: AtomicU64::new(0),
                },
            );
        }
        Ok(CommandDispatcher {
            table,
            metrics: self.metrics,
            stopped: AtomicBool::new(false),
        })
    }
}

pub struct CommandDispatcher {
    table: HashMap<CommandKind, HandlerEntry>,
    metrics: Arc<NodeAgentMetrics>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("kinds", &self.table.keys().collect::<Vec<_>>())
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl CommandDispatcher {
    pub fn builder(metrics: Arc<NodeAgentMetrics>) -> DispatcherBuilder {
        DispatcherBuilder::new(metrics)
    }

    /// Route one command to its handler and report the resulting status.
    /// Never panics and never propagates handler failures.
    pub async fn dispatch(&self, command: &ControllerCommand) -> CommandStatus {
        let kind = command.kind();
        let Some(entry) = self.table.get(&kind) else {
            error!(command_id = command.id, %kind, "no handler registered, dropping command");
            self.metrics.record_command_dropped();
            return CommandStatus::Failed;
        };
        entry.invocations.fetch_add(1, Ordering::Relaxed);
        debug!(command_id = command.id, %kind, "dispatching command");
        match entry.handler.handle(command).await {
            Ok(status) => status,
            Err(e) => {
                entry.failures.fetch_add(1, Ordering::Relaxed);
                warn!(command_id = command.id, %kind, error = %e, "command handler failed");
                CommandStatus::Failed
            }
        }
    }

    pub fn registered_kinds(&self) -> Vec<CommandKind> {
        self.table.keys().copied().collect()
    }

    pub fn invocation_count(&self, kind: CommandKind) -> u64 {
        self.table
            .get(&kind)
            .map(|e| e.invocations.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn failure_count(&self, kind: CommandKind) -> u64 {
        self.table
            .get(&kind)
            .map(|e| e.failures.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Stop handler-owned resources. Later calls are no-ops.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for entry in self.table.values() {
            entry.handler.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use slate_common::command::CommandPayload;
    use std::time::Duration;

    /// Records dispatch order and simulates failures on demand.
    struct RecordingHandler {
        kind: CommandKind,
        log: Arc<Mutex<Vec<u64>>>,
        fail: bool,
        stops: Arc<AtomicU64>,
        /// Set while a dispatch is running, to detect overlap.
        active: Arc<AtomicBool>,
        overlapped: Arc<AtomicBool>,
    }

    impl RecordingHandler {
        fn new(kind: CommandKind, log: Arc<Mutex<Vec<u64>>>) -> Self {
            Self {
                kind,
                log,
                fail: false,
                stops: Arc::new(AtomicU64::new(0)),
                active: Arc::new(AtomicBool::new(false)),
                overlapped: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl CommandHandler for RecordingHandler {
        fn kind(&self) -> CommandKind {
            self.kind
        }

        async fn handle(
            &self,
            command: &ControllerCommand,
        ) -> Result<CommandStatus, HandlerError> {
            if self.active.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.log.lock().push(command.id);
            self.active.store(false, Ordering::SeqCst);
            if self.fail {
                return Err(HandlerError::EngineUnavailable);
            }
            Ok(CommandStatus::Executed)
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn close_cmd(id: u64) -> ControllerCommand {
        ControllerCommand::new(id, CommandPayload::CloseContainer { container_id: id })
    }

    #[tokio::test]
    async fn routes_to_registered_handler_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(RecordingHandler::new(
            CommandKind::CloseContainer,
            Arc::clone(&log),
        ));
        let overlapped = Arc::clone(&handler.overlapped);
        let dispatcher = CommandDispatcher::builder(Arc::new(NodeAgentMetrics::new()))
            .add_handler(handler)
            .build()
            .expect("build");

        for id in [1, 2, 3] {
            let status = dispatcher.dispatch(&close_cmd(id)).await;
            assert_eq!(status, CommandStatus::Executed);
        }
        assert_eq!(*log.lock(), vec![1, 2, 3]);
        assert!(!overlapped.load(Ordering::SeqCst), "dispatches overlapped");
        assert_eq!(dispatcher.invocation_count(CommandKind::CloseContainer), 3);
    }

    #[tokio::test]
    async fn unregistered_kind_is_dropped_not_fatal() {
        let metrics = Arc::new(NodeAgentMetrics::new());
        let dispatcher = CommandDispatcher::builder(Arc::clone(&metrics))
            .build()
            .expect("build");
        let status = dispatcher.dispatch(&close_cmd(9)).await;
        assert_eq!(status, CommandStatus::Failed);
        assert_eq!(metrics.commands_dropped(), 1);
    }

    #[tokio::test]
    async fn handler_failure_maps_to_failed_status() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handler = RecordingHandler::new(CommandKind::CloseContainer, log);
        handler.fail = true;
        let dispatcher = CommandDispatcher::builder(Arc::new(NodeAgentMetrics::new()))
            .add_handler(Arc::new(handler))
            .build()
            .expect("build");
        let status = dispatcher.dispatch(&close_cmd(4)).await;
        assert_eq!(status, CommandStatus::Failed);
        assert_eq!(dispatcher.failure_count(CommandKind::CloseContainer), 1);
    }

    #[tokio::test]
    async fn duplicate_registration_rejected_at_build() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = CommandDispatcher::builder(Arc::new(NodeAgentMetrics::new()))
            .add_handler(Arc::new(RecordingHandler::new(
                CommandKind::DeleteContainer,
                Arc::clone(&log),
            )))
            .add_handler(Arc::new(RecordingHandler::new(
                CommandKind::DeleteContainer,
                log,
            )))
            .build()
            .unwrap_err();
        assert_eq!(err, DuplicateHandlerError(CommandKind::DeleteContainer));
    }

    #[tokio::test]
    async fn stop_reaches_each_handler_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(RecordingHandler::new(
            CommandKind::CloseContainer,
            Arc::clone(&log),
        ));
        let stops = Arc::clone(&handler.stops);
        let dispatcher = CommandDispatcher::builder(Arc::new(NodeAgentMetrics::new()))
            .add_handler(handler)
            .build()
            .expect("build");
        dispatcher.stop().await;
        dispatcher.stop().await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
