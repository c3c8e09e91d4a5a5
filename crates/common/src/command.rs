//! Controller Commands
//!
//! Typed units of work issued by a cluster controller. Each command
//! carries a controller-assigned, monotonically increasing identifier
//! used for idempotent re-delivery and status reporting.
//!
//! ## Command Lifecycle
//!
//! ```text
//! received from session → queued → dequeued exactly once
//!     → dispatched to exactly one handler → outcome recorded → discarded
//! ```
//!
//! Execution outcome is reported back through the command-status report;
//! this layer never retries a command on its own.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Controller-assigned command identifier. Monotonically increasing
/// per controller.
pub type CommandId = u64;

// ════════════════════════════════════════════════════════════════════════════
// COMMAND KIND
// ════════════════════════════════════════════════════════════════════════════

/// Command-type tag used by the dispatcher's routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    ReplicateContainer,
    DeleteContainer,
    DeleteBlocks,
    CloseContainer,
    FinalizeUpgrade,
    RefreshVolumeUsage,
    SetNodeOperationalState,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::ReplicateContainer => "replicate_container",
            CommandKind::DeleteContainer => "delete_container",
            CommandKind::DeleteBlocks => "delete_blocks",
            CommandKind::CloseContainer => "close_container",
            CommandKind::FinalizeUpgrade => "finalize_upgrade",
            CommandKind::RefreshVolumeUsage => "refresh_volume_usage",
            CommandKind::SetNodeOperationalState => "set_node_operational_state",
        };
        write!(f, "{}", name)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// OPERATIONAL STATE
// ════════════════════════════════════════════════════════════════════════════

/// Administrative operational state the controller can place a node in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOperationalState {
    InService,
    Decommissioning,
    Decommissioned,
    EnteringMaintenance,
    InMaintenance,
}

impl Default for NodeOperationalState {
    fn default() -> Self {
        NodeOperationalState::InService
    }
}

impl fmt::Display for NodeOperationalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeOperationalState::InService => "in_service",
            NodeOperationalState::Decommissioning => "decommissioning",
            NodeOperationalState::Decommissioned => "decommissioned",
            NodeOperationalState::EnteringMaintenance => "entering_maintenance",
            NodeOperationalState::InMaintenance => "in_maintenance",
        };
        write!(f, "{}", name)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// COMMAND PAYLOAD
// ════════════════════════════════════════════════════════════════════════════

/// The typed body of a controller command.
///
/// Container and block identifiers are opaque to this layer; they are
/// forwarded to the storage engine unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandPayload {
    /// Obtain a copy of a container from one of the candidate sources.
    ReplicateContainer {
        container_id: u64,
        /// Candidate source node addresses, in controller-preferred order.
        sources: Vec<String>,
    },
    /// Remove a container replica from this node.
    DeleteContainer { container_id: u64, force: bool },
    /// Delete a batch of blocks inside a container.
    DeleteBlocks {
        container_id: u64,
        block_ids: Vec<u64>,
    },
    /// Move a container to the closed state.
    CloseContainer { container_id: u64 },
    /// Complete a pending layout-version upgrade.
    FinalizeUpgrade,
    /// Re-read volume usage from the storage engine.
    RefreshVolumeUsage,
    /// Set the administrative operational state of this node.
    SetNodeOperationalState {
        state: NodeOperationalState,
        /// Epoch seconds after which the state expires back to in-service.
        /// Zero means no expiry.
        expiry_epoch_secs: u64,
    },
}

impl CommandPayload {
    /// Routing tag for this payload.
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandPayload::ReplicateContainer { .. } => CommandKind::ReplicateContainer,
            CommandPayload::DeleteContainer { .. } => CommandKind::DeleteContainer,
            CommandPayload::DeleteBlocks { .. } => CommandKind::DeleteBlocks,
            CommandPayload::CloseContainer { .. } => CommandKind::CloseContainer,
            CommandPayload::FinalizeUpgrade => CommandKind::FinalizeUpgrade,
            CommandPayload::RefreshVolumeUsage => CommandKind::RefreshVolumeUsage,
            CommandPayload::SetNodeOperationalState { .. } => {
                CommandKind::SetNodeOperationalState
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CONTROLLER COMMAND
// ════════════════════════════════════════════════════════════════════════════

/// A command as received from a controller session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerCommand {
    /// Controller-assigned identifier, monotonically increasing.
    pub id: CommandId,
    pub payload: CommandPayload,
}

impl ControllerCommand {
    pub fn new(id: CommandId, payload: CommandPayload) -> Self {
        Self { id, payload }
    }

    pub fn kind(&self) -> CommandKind {
        self.payload.kind()
    }
}

/// Execution outcome of a dispatched command, reported back to the
/// controller through the command-status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Queued or handed to an asynchronous handler pool.
    Pending,
    /// Handler completed successfully.
    Executed,
    /// Handler failed or no handler was registered. Not retried here.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_kind_mapping() {
        let cases: Vec<(CommandPayload, CommandKind)> = vec![
            (
                CommandPayload::ReplicateContainer {
                    container_id: 7,
                    sources: vec!["10.0.0.1:9859".to_string()],
                },
                CommandKind::ReplicateContainer,
            ),
            (
                CommandPayload::DeleteContainer {
                    container_id: 7,
                    force: false,
                },
                CommandKind::DeleteContainer,
            ),
            (CommandPayload::FinalizeUpgrade, CommandKind::FinalizeUpgrade),
            (
                CommandPayload::RefreshVolumeUsage,
                CommandKind::RefreshVolumeUsage,
            ),
        ];
        for (payload, kind) in cases {
            assert_eq!(payload.kind(), kind);
        }
    }

    #[test]
    fn wire_format_is_tagged_snake_case() {
        let cmd = ControllerCommand::new(
            42,
            CommandPayload::DeleteBlocks {
                container_id: 3,
                block_ids: vec![10, 11],
            },
        );
        let json = serde_json::to_string(&cmd).expect("serialize");
        assert!(json.contains("\"type\":\"delete_blocks\""), "{}", json);
        let back: ControllerCommand = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, cmd);
        assert_eq!(back.kind(), CommandKind::DeleteBlocks);
    }
}
