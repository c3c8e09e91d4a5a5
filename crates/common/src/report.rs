//! Heartbeat Report Payloads
//!
//! Snapshot types bundled into each outgoing heartbeat. One type per
//! report kind: node, container, pipeline, command-status and
//! revocation-list. The report manager assembles the current snapshots
//! into a [`HeartbeatPayload`]; the connection manager attaches that
//! payload to every heartbeat exchange.
//!
//! These are plain serializable values. Producing them is the job of the
//! report publishers in `slate-node`.

use serde::{Deserialize, Serialize};

use crate::command::{CommandId, CommandKind, CommandStatus, NodeOperationalState};

// ════════════════════════════════════════════════════════════════════════════
// NODE REPORT
// ════════════════════════════════════════════════════════════════════════════

/// Per-volume capacity snapshot as reported by the storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeReport {
    pub path: String,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub failed: bool,
}

/// Whole-node capacity and health snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub volumes: Vec<VolumeReport>,
    pub failed_volume_count: u64,
    #[serde(default)]
    pub operational_state: NodeOperationalState,
}

// ════════════════════════════════════════════════════════════════════════════
// CONTAINER REPORT
// ════════════════════════════════════════════════════════════════════════════

/// Replica state of a container on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Open,
    Closing,
    Closed,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerReplicaReport {
    pub container_id: u64,
    pub state: ContainerState,
    pub used_bytes: u64,
    pub key_count: u64,
}

/// All container replicas currently held by this node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerReport {
    pub replicas: Vec<ContainerReplicaReport>,
}

// ════════════════════════════════════════════════════════════════════════════
// PIPELINE / COMMAND STATUS / REVOCATION REPORTS
// ════════════════════════════════════════════════════════════════════════════

/// Write pipelines this node participates in. Membership is maintained
/// by the out-of-scope write path; this core only reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub pipeline_ids: Vec<String>,
}

/// Outcome of one dispatched controller command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStatusEntry {
    pub command_id: CommandId,
    pub kind: CommandKind,
    pub status: CommandStatus,
}

/// Drained command-status ledger entries since the last heartbeat that
/// carried them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStatusReport {
    pub entries: Vec<CommandStatusEntry>,
}

/// Certificate-revocation processing position of this node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationListReport {
    /// Highest revocation sequence number this node has processed.
    pub processed_sequence: u64,
    /// Revocation ids received but not yet applied.
    pub pending_ids: Vec<u64>,
}

// ════════════════════════════════════════════════════════════════════════════
// HEARTBEAT PAYLOAD
// ════════════════════════════════════════════════════════════════════════════

/// Everything attached to one outgoing heartbeat. A missing snapshot
/// means the corresponding publisher has not produced one yet; the
/// controller treats absent sections as "unchanged".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub node_id: String,
    pub node_report: Option<NodeReport>,
    pub container_report: Option<ContainerReport>,
    pub pipeline_report: Option<PipelineReport>,
    pub command_status_report: Option<CommandStatusReport>,
    pub revocation_report: Option<RevocationListReport>,
}

impl HeartbeatPayload {
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandStatus;

    #[test]
    fn empty_payload_serializes_with_null_sections() {
        let payload = HeartbeatPayload::for_node("node-1");
        let json = serde_json::to_string(&payload).expect("serialize");
        assert!(json.contains("\"node_id\":\"node-1\""));
        assert!(json.contains("\"node_report\":null"));
    }

    #[test]
    fn command_status_entries_round_trip() {
        let report = CommandStatusReport {
            entries: vec![CommandStatusEntry {
                command_id: 9,
                kind: CommandKind::CloseContainer,
                status: CommandStatus::Executed,
            }],
        };
        let json = serde_json::to_string(&report).expect("serialize");
        let back: CommandStatusReport = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, report);
    }
}
