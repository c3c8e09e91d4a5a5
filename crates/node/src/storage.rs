//! Storage Engine Seam
//!
//! The physical storage engine is an external collaborator. This module
//! defines the traits the agent consumes ([`ContainerSet`],
//! [`ContainerController`]), the published engine handle, and the
//! volume-failure tracker that escalates persistent volume loss.
//!
//! ## Construct-Then-Publish
//!
//! The engine is built privately by the hosting process and published
//! into an [`EngineSlot`] exactly once. Readers either see `None` or the
//! fully built handle; a partially constructed engine is never reachable
//! from another thread. A second publish is rejected.
//!
//! ## Reference Implementation
//!
//! [`InMemoryEngine`] implements both traits against an in-process map.
//! It backs the test suite and the demo binary; a production deployment
//! publishes its real engine instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::error;

use slate_common::report::{
    ContainerReplicaReport, ContainerReport, ContainerState, VolumeReport,
};

/// Errors surfaced by the storage engine seam.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("container {0} not found")]
    ContainerNotFound(u64),
    #[error("container {0} already exists")]
    ContainerExists(u64),
    #[error("engine error: {0}")]
    Engine(String),
    #[error("engine handle already published")]
    AlreadyPublished,
    #[error("engine handle not published yet")]
    NotPublished,
}

// ════════════════════════════════════════════════════════════════════════════
// ENGINE TRAITS
// ════════════════════════════════════════════════════════════════════════════

/// Read-mostly view of the containers and volumes held by this node.
pub trait ContainerSet: Send + Sync {
    fn container_ids(&self) -> Vec<u64>;
    fn has_container(&self, container_id: u64) -> bool;
    fn container_report(&self) -> ContainerReport;
    fn volume_reports(&self) -> Vec<VolumeReport>;
    /// Re-read usage numbers from the underlying volumes.
    fn refresh_volume_usage(&self);
}

/// Mutating operations on containers, driven by controller commands and
/// replication jobs.
#[async_trait]
pub trait ContainerController: Send + Sync {
    async fn create_container(&self, container_id: u64) -> Result<(), StorageError>;
    /// Import a replicated container of the given size.
    async fn import_container(&self, container_id: u64, bytes: u64) -> Result<(), StorageError>;
    async fn delete_container(&self, container_id: u64, force: bool) -> Result<(), StorageError>;
    async fn close_container(&self, container_id: u64) -> Result<(), StorageError>;
    /// Delete a batch of blocks; returns how many were actually removed.
    async fn delete_blocks(
        &self,
        container_id: u64,
        block_ids: &[u64],
    ) -> Result<u64, StorageError>;
}

/// The fully built engine as published to the agent.
pub struct EngineHandle {
    pub container_set: Arc<dyn ContainerSet>,
    pub controller: Arc<dyn ContainerController>,
}

// ════════════════════════════════════════════════════════════════════════════
// ENGINE SLOT (two-phase publish)
// ════════════════════════════════════════════════════════════════════════════

/// Holds the engine handle across its two-phase lifecycle: empty while
/// the engine is under private construction, then exactly one atomic
/// publish of the immutable handle.
#[derive(Default)]
pub struct EngineSlot {
    inner: RwLock<Option<Arc<EngineHandle>>>,
}

impl EngineSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the built handle. Exactly one publish succeeds.
    pub fn publish(&self, handle: EngineHandle) -> Result<(), StorageError> {
        let mut slot = self.inner.write();
        if slot.is_some() {
            return Err(StorageError::AlreadyPublished);
        }
        *slot = Some(Arc::new(handle));
        Ok(())
    }

    /// The published handle, or `None` before publication.
    pub fn get(&self) -> Option<Arc<EngineHandle>> {
        self.inner.read().clone()
    }

    /// The published handle, or an error for callers that require it.
    pub fn require(&self) -> Result<Arc<EngineHandle>, StorageError> {
        self.get().ok_or(StorageError::NotPublished)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// VOLUME HEALTH TRACKER
// ════════════════════════════════════════════════════════════════════════════

/// Counts failed storage volumes against the configured tolerance.
///
/// The first failure beyond the tolerance invokes the fatal hook exactly
/// once; later failures only bump the counter. The hook is installed by
/// the state machine and escalates to a full process stop.
pub struct VolumeHealthTracker {
    failed: AtomicU64,
    tolerated: u64,
    escalated: AtomicBool,
    fatal_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl VolumeHealthTracker {
    pub fn new(tolerated: u64) -> Self {
        Self {
            failed: AtomicU64::new(0),
            tolerated,
            escalated: AtomicBool::new(false),
            fatal_hook: Mutex::new(None),
        }
    }

    pub fn set_fatal_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.fatal_hook.lock() = Some(Box::new(hook));
    }

    pub fn failed_volume_count(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }

    pub fn tolerated(&self) -> u64 {
        self.tolerated
    }

    /// Record one failed volume. Escalates on the first crossing of the
    /// tolerance threshold.
    pub fn record_volume_failure(&self) {
        let failed = self.failed.fetch_add(1, Ordering::AcqRel) + 1;
        if failed > self.tolerated && !self.escalated.swap(true, Ordering::AcqRel) {
            error!(
                failed,
                tolerated = self.tolerated,
                "failed volume count exceeds tolerance"
            );
            if let Some(hook) = self.fatal_hook.lock().as_ref() {
                hook();
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// IN-MEMORY REFERENCE ENGINE
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct ContainerRecord {
    state: ContainerState,
    used_bytes: u64,
    key_count: u64,
}

/// In-process engine used by tests and the demo binary. Keeps an
/// operation log so ordering-sensitive tests can observe dispatch order.
pub struct InMemoryEngine {
    containers: RwLock<HashMap<u64, ContainerRecord>>,
    volumes: RwLock<Vec<VolumeReport>>,
    op_log: Mutex<Vec<String>>,
    usage_refreshes: AtomicU64,
}

impl InMemoryEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            containers: RwLock::new(HashMap::new()),
            volumes: RwLock::new(vec![VolumeReport {
                path: "/data/vol0".to_string(),
                capacity_bytes: 64 * 1024 * 1024 * 1024,
                used_bytes: 0,
                available_bytes: 64 * 1024 * 1024 * 1024,
                failed: false,
            }]),
            op_log: Mutex::new(Vec::new()),
            usage_refreshes: AtomicU64::new(0),
        })
    }

    /// Build a published-ready handle over this engine.
    pub fn handle(self: &Arc<Self>) -> EngineHandle {
        EngineHandle {
            container_set: Arc::clone(self) as Arc<dyn ContainerSet>,
            controller: Arc::clone(self) as Arc<dyn ContainerController>,
        }
    }

    /// Ordered log of mutating operations, for tests.
    pub fn op_log(&self) -> Vec<String> {
        self.op_log.lock().clone()
    }

    pub fn usage_refreshes(&self) -> u64 {
        self.usage_refreshes.load(Ordering::Acquire)
    }

    /// Seed a container without going through the controller path.
    pub fn insert_container(&self, container_id: u64, used_bytes: u64, key_count: u64) {
        self.containers.write().insert(
            container_id,
            ContainerRecord {
                state: ContainerState::Open,
                used_bytes,
                key_count,
            },
        );
    }

    fn log_op(&self, op: String) {
        self.op_log.lock().push(op);
    }
}

impl ContainerSet for InMemoryEngine {
    fn container_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.containers.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn has_container(&self, container_id: u64) -> bool {
        self.containers.read().contains_key(&container_id)
    }

    fn container_report(&self) -> ContainerReport {
        let containers = self.containers.read();
        let mut replicas: Vec<ContainerReplicaReport> = containers
            .iter()
            .map(|(id, rec)| ContainerReplicaReport {
                container_id: *id,
                state: rec.state,
                used_bytes: rec.used_bytes,
                key_count: rec.key_count,
            })
            .collect();
        replicas.sort_unstable_by_key(|r| r.container_id);
        ContainerReport { replicas }
    }

    fn volume_reports(&self) -> Vec<VolumeReport> {
        self.volumes.read().clone()
    }

    fn refresh_volume_usage(&self) {
        let used: u64 = self
            .containers
            .read()
            .values()
            .map(|r| r.used_bytes)
            .sum();
        let mut volumes = self.volumes.write();
        for vol in volumes.iter_mut() {
            vol.used_bytes = used;
            vol.available_bytes = vol.capacity_bytes.saturating_sub(used);
        }
        self.usage_refreshes.fetch_add(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl ContainerController for InMemoryEngine {
    async fn create_container(&self, container_id: u64) -> Result<(), StorageError> {
        let mut containers = self.containers.write();
        if containers.contains_key(&container_id) {
            return Err(StorageError::ContainerExists(container_id));
        }
        containers.insert(
            container_id,
            ContainerRecord {
                state: ContainerState::Open,
                used_bytes: 0,
                key_count: 0,
            },
        );
        drop(containers);
        self.log_op(format!("create:{}", container_id));
        Ok(())
    }

    async fn import_container(&self, container_id: u64, bytes: u64) -> Result<(), StorageError> {
        let mut containers = self.containers.write();
        if containers.contains_key(&container_id) {
            return Err(StorageError::ContainerExists(container_id));
        }
        containers.insert(
            container_id,
            ContainerRecord {
                state: ContainerState::Closed,
                used_bytes: bytes,
                key_count: 0,
            },
        );
        drop(containers);
        self.log_op(format!("import:{}", container_id));
        Ok(())
    }

    async fn delete_container(&self, container_id: u64, force: bool) -> Result<(), StorageError> {
        let mut containers = self.containers.write();
        match containers.get(&container_id) {
            None => return Err(StorageError::ContainerNotFound(container_id)),
            Some(rec) if rec.state == ContainerState::Open && !force => {
                return Err(StorageError::Engine(format!(
                    "container {} is open; deletion requires force",
                    container_id
                )));
            }
            Some(_) => {
                containers.remove(&container_id);
            }
        }
        drop(containers);
        self.log_op(format!("delete:{}", container_id));
        Ok(())
    }

    async fn close_container(&self, container_id: u64) -> Result<(), StorageError> {
        let mut containers = self.containers.write();
        let rec = containers
            .get_mut(&container_id)
            .ok_or(StorageError::ContainerNotFound(container_id))?;
        rec.state = ContainerState::Closed;
        drop(containers);
        self.log_op(format!("close:{}", container_id));
        Ok(())
    }

    async fn delete_blocks(
        &self,
        container_id: u64,
        block_ids: &[u64],
    ) -> Result<u64, StorageError> {
        let containers = self.containers.read();
        if !containers.contains_key(&container_id) {
            return Err(StorageError::ContainerNotFound(container_id));
        }
        drop(containers);
        self.log_op(format!("delete_blocks:{}:{}", container_id, block_ids.len()));
        Ok(block_ids.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as TestCounter;

    #[test]
    fn engine_slot_single_publish() {
        let slot = EngineSlot::new();
        assert!(slot.get().is_none());
        assert!(matches!(slot.require(), Err(StorageError::NotPublished)));

        let engine = InMemoryEngine::new();
        slot.publish(engine.handle()).expect("first publish");
        let first = slot.get().expect("published");

        let second_engine = InMemoryEngine::new();
        assert_eq!(
            slot.publish(second_engine.handle()).unwrap_err(),
            StorageError::AlreadyPublished
        );
        // Readers keep seeing the originally published handle.
        assert!(Arc::ptr_eq(&first, &slot.get().expect("still published")));
    }

    #[test]
    fn volume_tracker_escalates_once() {
        let tracker = VolumeHealthTracker::new(1);
        let fired = Arc::new(TestCounter::new(0));
        {
            let fired = Arc::clone(&fired);
            tracker.set_fatal_hook(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        tracker.record_volume_failure();
        assert_eq!(fired.load(Ordering::SeqCst), 0, "within tolerance");
        tracker.record_volume_failure();
        assert_eq!(fired.load(Ordering::SeqCst), 1, "tolerance exceeded");
        tracker.record_volume_failure();
        tracker.record_volume_failure();
        assert_eq!(fired.load(Ordering::SeqCst), 1, "hook fires exactly once");
        assert_eq!(tracker.failed_volume_count(), 4);
    }

    #[tokio::test]
    async fn in_memory_engine_lifecycle() {
        let engine = InMemoryEngine::new();
        engine.create_container(1).await.expect("create");
        engine.close_container(1).await.expect("close");
        engine.import_container(2, 4096).await.expect("import");
        assert_eq!(engine.container_ids(), vec![1, 2]);

        // Open containers refuse non-forced deletion.
        engine.create_container(3).await.expect("create");
        assert!(engine.delete_container(3, false).await.is_err());
        engine.delete_container(3, true).await.expect("forced delete");

        let report = engine.container_report();
        assert_eq!(report.replicas.len(), 2);
        assert_eq!(report.replicas[1].used_bytes, 4096);

        engine.refresh_volume_usage();
        assert_eq!(engine.volume_reports()[0].used_bytes, 4096);
        assert_eq!(engine.usage_refreshes(), 1);

        assert_eq!(
            engine.op_log(),
            vec!["create:1", "close:1", "import:2", "create:3", "delete:3"]
        );
    }
}
