//! # Slate Common Crate
//!
//! Shared types for the slate storage-node control-plane agent.
//!
//! ## Modules
//! - `lifecycle`: node lifecycle state machine (Init → Running → Shutdown)
//! - `command`: typed controller commands and execution status
//! - `report`: heartbeat report payload types
//! - `config`: agent configuration management
//!
//! Everything here is plain data: serializable, no async, no IO beyond
//! the config loader. The `slate-node` crate owns all runtime behavior.

pub mod command;
pub mod config;
pub mod lifecycle;
pub mod report;

pub use command::{
    CommandId, CommandKind, CommandPayload, CommandStatus, ControllerCommand,
    NodeOperationalState,
};
pub use config::{AgentConfig, ConfigError};
pub use lifecycle::NodeLifecycleState;
pub use report::{
    CommandStatusEntry, CommandStatusReport, ContainerReplicaReport, ContainerReport,
    ContainerState, HeartbeatPayload, NodeReport, PipelineReport, RevocationListReport,
    VolumeReport,
};
