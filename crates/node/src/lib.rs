//! # Slate Node Crate
//!
//! Per-node control-plane agent for a slate block-storage cluster. The
//! agent keeps a session with every configured cluster controller,
//! reports node/container state on each heartbeat, executes the
//! administrative commands the controllers issue, and supervises
//! background replication work.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                       NodeStateMachine                        │
//! │                                                               │
//! │  heartbeat loop ──▶ ConnectionManager ──▶ controller sessions │
//! │        │                    │                                 │
//! │        │ payload            │ commands                        │
//! │        ▼                    ▼                                 │
//! │  ReportManager        StateContext (queue, state, flags)      │
//! │                             │                                 │
//! │                             ▼                                 │
//! │  command processor ──▶ CommandDispatcher ──▶ handlers         │
//! │   (supervised)                                  │             │
//! │                                                 ▼             │
//! │                                    ReplicationSupervisor      │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The storage engine, the controller wire transport, the layout-version
//! marker and the revocation source are external collaborators consumed
//! through traits (`storage`, `connection`, `upgrade`, `reports`).

pub mod command_handlers;
pub mod connection;
pub mod context;
pub mod controller_client;
pub mod dispatcher;
pub mod http;
pub mod metrics;
pub mod pause_monitor;
pub mod replication;
pub mod reports;
pub mod state_machine;
pub mod storage;
pub mod supervised;
pub mod upgrade;


pub use connection::{ConnectionManager, ControllerEndpoint, EndpointError, SessionStats};
pub use context::{ExitReason, StateContext, StateTransitionError};
pub use controller_client::{HttpContainerDownloader, HttpControllerClient};
pub use dispatcher::{CommandDispatcher, CommandHandler, DispatcherBuilder, HandlerError};
pub use metrics::NodeAgentMetrics;
pub use pause_monitor::{PauseMonitor, PauseMonitorConfig};
pub use replication::{
    ContainerDownloader, ContainerReplicator, DownloadAndImportReplicator, MeasuredReplicator,
    ReplicationJob, ReplicationSupervisor,
};
pub use reports::{ReportManager, ReportPublisher, RevocationSource};
pub use state_machine::{NodeStateMachine, NodeStopService};
pub use storage::{
    ContainerController, ContainerSet, EngineHandle, EngineSlot, InMemoryEngine, StorageError,
    VolumeHealthTracker,
};
pub use supervised::SupervisedTask;
pub use upgrade::{
    FileLayoutStore, LayoutVersionStore, UpgradeFinalizer, UpgradeState, UpgradeStatus,
};
