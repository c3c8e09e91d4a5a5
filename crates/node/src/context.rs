//! Shared Execution Context
//!
//! [`StateContext`] is the process-wide state owned by the state machine
//! for its lifetime, and the single source of truth for:
//!
//! - the current lifecycle state
//! - the execution-cycle counter
//! - the pending-command queue (insertion-ordered, unbounded)
//! - the fatal-shutdown flag, distinct from the graceful flag
//! - the recorded exit reason (graceful vs fatal)
//! - the command-status ledger drained into heartbeat reports
//! - the wake signals for the heartbeat loop and the command processor
//!
//! ## Concurrency
//!
//! Mutated by the heartbeat loop (state, cycle counter), the connection
//! manager (enqueues commands, one producer per session), the command
//! processor (dequeues, single consumer) and any component that raises a
//! fatal condition. All interior state sits behind `parking_lot` locks or
//! atomics; there are no bare shared fields.
//!
//! ## Transition Rules
//!
//! `set_state` enforces the strict monotonic rule from
//! [`NodeLifecycleState::is_transition_allowed`]. `force_shutdown_state`
//! bypasses it so shutdown is always reachable, from any state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use slate_common::command::{CommandId, CommandKind, CommandStatus, ControllerCommand};
use slate_common::lifecycle::NodeLifecycleState;
use slate_common::report::CommandStatusEntry;

/// Why the agent left the running state. Recorded once; the first writer
/// wins, so a fatal escalation that races a graceful stop is preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Graceful,
    Fatal,
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("lifecycle transition {from} -> {to} is not allowed")]
pub struct StateTransitionError {
    pub from: NodeLifecycleState,
    pub to: NodeLifecycleState,
}

pub struct StateContext {
    state: Mutex<NodeLifecycleState>,
    execution_count: AtomicU64,
    command_queue: Mutex<VecDeque<ControllerCommand>>,
    shutdown_on_error: AtomicBool,
    graceful_shutdown: AtomicBool,
    exit_reason: Mutex<Option<ExitReason>>,
    command_statuses: Mutex<Vec<CommandStatusEntry>>,
    heartbeat_interval: Duration,
    /// Wakes the heartbeat loop out of its inter-cycle sleep.
    trigger: Notify,
    /// Wakes every sleeping loop during shutdown.
    shutdown: Notify,
}

impl StateContext {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            state: Mutex::new(NodeLifecycleState::initial()),
            execution_count: AtomicU64::new(0),
            command_queue: Mutex::new(VecDeque::new()),
            shutdown_on_error: AtomicBool::new(false),
            graceful_shutdown: AtomicBool::new(false),
            exit_reason: Mutex::new(None),
            command_statuses: Mutex::new(Vec::new()),
            heartbeat_interval,
            trigger: Notify::new(),
            shutdown: Notify::new(),
        }
    }

    // ════════════════════════════════════════════════════════════════════
    // LIFECYCLE STATE
    // ════════════════════════════════════════════════════════════════════

    pub fn state(&self) -> NodeLifecycleState {
        *self.state.lock()
    }

    /// Strict transition. Rejected unless the target rank is greater
    /// than the current rank.
    pub fn set_state(&self, to: NodeLifecycleState) -> Result<(), StateTransitionError> {
        let mut state = self.state.lock();
        let from = *state;
        if !from.is_transition_allowed(to) {
            return Err(StateTransitionError { from, to });
        }
        debug!(%from, %to, "lifecycle transition");
        *state = to;
        Ok(())
    }

    /// Shutdown must always be reachable; this bypasses the strict rule.
    pub fn force_shutdown_state(&self) {
        let mut state = self.state.lock();
        let from = *state;
        if !from.is_terminal() {
            debug!(%from, "forcing shutdown state");
            *state = NodeLifecycleState::terminal();
        }
    }

    // ════════════════════════════════════════════════════════════════════
    // EXECUTION CYCLES
    // ════════════════════════════════════════════════════════════════════

    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::Acquire)
    }

    /// Returns the cycle number just entered (1-based).
    pub fn begin_cycle(&self) -> u64 {
        self.execution_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    // ════════════════════════════════════════════════════════════════════
    // COMMAND QUEUE (multi-producer, single consumer)
    // ════════════════════════════════════════════════════════════════════

    pub fn add_command(&self, command: ControllerCommand) {
        self.command_queue.lock().push_back(command);
    }

    pub fn add_commands(&self, commands: impl IntoIterator<Item = ControllerCommand>) {
        let mut queue = self.command_queue.lock();
        queue.extend(commands);
    }

    /// Non-blocking pop in FIFO arrival order.
    pub fn next_command(&self) -> Option<ControllerCommand> {
        self.command_queue.lock().pop_front()
    }

    pub fn queued_command_count(&self) -> usize {
        self.command_queue.lock().len()
    }

    // ════════════════════════════════════════════════════════════════════
    // SHUTDOWN FLAGS & EXIT REASON
    // ════════════════════════════════════════════════════════════════════

    /// Raise the fatal flag. The heartbeat loop escalates to a full
    /// process stop once it observes this after a cycle.
    pub fn set_shutdown_on_error(&self) {
        self.shutdown_on_error.store(true, Ordering::Release);
    }

    pub fn shutdown_on_error(&self) -> bool {
        self.shutdown_on_error.load(Ordering::Acquire)
    }

    pub fn set_graceful_shutdown(&self) {
        self.graceful_shutdown.store(true, Ordering::Release);
    }

    pub fn is_graceful_shutdown(&self) -> bool {
        self.graceful_shutdown.load(Ordering::Acquire)
    }

    /// First writer wins; later reports of a different reason are ignored.
    pub fn record_exit_reason(&self, reason: ExitReason) {
        let mut slot = self.exit_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        *self.exit_reason.lock()
    }

    // ════════════════════════════════════════════════════════════════════
    // COMMAND STATUS LEDGER
    // ════════════════════════════════════════════════════════════════════

    /// Record or update the status of a command. An existing entry for
    /// the same id is overwritten, so Pending → Executed transitions
    /// collapse into the final outcome if they land between drains.
    pub fn record_command_status(&self, id: CommandId, kind: CommandKind, status: CommandStatus) {
        let mut ledger = self.command_statuses.lock();
        if let Some(entry) = ledger.iter_mut().find(|e| e.command_id == id) {
            entry.status = status;
        } else {
            ledger.push(CommandStatusEntry {
                command_id: id,
                kind,
                status,
            });
        }
    }

    /// Take every accumulated entry, leaving the ledger empty.
    pub fn drain_command_statuses(&self) -> Vec<CommandStatusEntry> {
        std::mem::take(&mut *self.command_statuses.lock())
    }

    // ════════════════════════════════════════════════════════════════════
    // WAKE SIGNALS
    // ════════════════════════════════════════════════════════════════════

    /// Request an out-of-band heartbeat. Wakes at most one sleeping loop
    /// iteration; a stored permit never produces a second cycle.
    pub fn trigger_heartbeat(&self) {
        self.trigger.notify_one();
    }

    /// Await the immediate-heartbeat trigger.
    pub async fn heartbeat_wakeup(&self) {
        self.trigger.notified().await;
    }

    /// Await the shutdown wake signal.
    pub async fn shutdown_wakeup(&self) {
        self.shutdown.notified().await;
    }

    /// Wake every sleeping loop (heartbeat loop and command processor).
    pub fn wake_all(&self) {
        self.shutdown.notify_waiters();
        self.trigger.notify_waiters();
    }
}
