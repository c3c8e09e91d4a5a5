//! Replication Supervisor
//!
//! Executes container replication jobs off the command-processing path,
//! so a slow or large transfer never blocks command ordering. A bounded
//! worker pool drains an unbounded job queue; a container already queued
//! or in flight is not queued twice. Jobs are retried only by controller
//! resubmission, never internally.
//!
//! The actual transfer happens behind [`ContainerReplicator`];
//! [`MeasuredReplicator`] wraps any replicator with duration and byte
//! accounting.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::metrics::NodeAgentMetrics;
use crate::storage::EngineSlot;

/// A request to obtain a copy of a container from one of the candidate
/// source nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationJob {
    pub container_id: u64,
    /// Candidate sources in controller-preferred order.
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("no usable source for container {0}")]
    NoSources(u64),
    #[error("download of container {container_id} from {source_node} failed: {reason}")]
    Download {
        container_id: u64,
        source_node: String,
        reason: String,
    },
    #[error("import of container {container_id} failed: {reason}")]
    Import { container_id: u64, reason: String },
}

/// Transfers one container replica onto this node.
#[async_trait]
pub trait ContainerReplicator: Send + Sync {
    /// Returns the number of bytes imported.
    async fn replicate(&self, job: &ReplicationJob) -> Result<u64, ReplicationError>;
}

/// Fetches raw container data from a remote node. The transfer protocol
/// itself is out of scope; implementations live at the wire seam.
#[async_trait]
pub trait ContainerDownloader: Send + Sync {
    /// Returns the number of bytes fetched.
    async fn download(&self, container_id: u64, source: &str) -> Result<u64, ReplicationError>;
}

// ════════════════════════════════════════════════════════════════════════════
// DOWNLOAD-AND-IMPORT REPLICATOR
// ════════════════════════════════════════════════════════════════════════════

/// Default replicator: try each candidate source in order, then import
/// the fetched container through the storage engine.
pub struct DownloadAndImportReplicator {
    downloader: Arc<dyn ContainerDownloader>,
    engine: Arc<EngineSlot>,
}

impl DownloadAndImportReplicator {
    pub fn new(downloader: Arc<dyn ContainerDownloader>, engine: Arc<EngineSlot>) -> Self {
        Self { downloader, engine }
    }
}

#[async_trait]
impl ContainerReplicator for DownloadAndImportReplicator {
    async fn replicate(&self, job: &ReplicationJob) -> Result<u64, ReplicationError> {
        let mut bytes = None;
        for source in &job.sources {
            match self.downloader.download(job.container_id, source).await {
                Ok(n) => {
                    bytes = Some(n);
                    break;
                }
                Err(e) => {
                    warn!(
                        container_id = job.container_id,
                        source = %source,
                        error = %e,
                        "source failed, trying next candidate"
                    );
                }
            }
        }
        let bytes = bytes.ok_or(ReplicationError::NoSources(job.container_id))?;

        let engine = self
            .engine
            .require()
            .map_err(|e| ReplicationError::Import {
                container_id: job.container_id,
                reason: e.to_string(),
            })?;
        engine
            .controller
            .import_container(job.container_id, bytes)
            .await
            .map_err(|e| ReplicationError::Import {
                container_id: job.container_id,
                reason: e.to_string(),
            })?;
        Ok(bytes)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MEASURED REPLICATOR
// ════════════════════════════════════════════════════════════════════════════

/// Wraps a replicator with success/failure, byte and wall-clock
/// accounting.
pub struct MeasuredReplicator {
    inner: Arc<dyn ContainerReplicator>,
    metrics: Arc<NodeAgentMetrics>,
}

impl MeasuredReplicator {
    pub fn new(inner: Arc<dyn ContainerReplicator>, metrics: Arc<NodeAgentMetrics>) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl ContainerReplicator for MeasuredReplicator {
    async fn replicate(&self, job: &ReplicationJob) -> Result<u64, ReplicationError> {
        let started = Instant::now();
        let result = self.inner.replicate(job).await;
        self.metrics
            .record_replication_busy_micros(started.elapsed().as_micros() as u64);
        match &result {
            Ok(bytes) => {
                self.metrics.record_replication_success();
                self.metrics.record_replication_bytes(*bytes);
            }
            Err(_) => self.metrics.record_replication_failure(),
        }
        result
    }
}

// ════════════════════════════════════════════════════════════════════════════
// REPLICATION SUPERVISOR
// ════════════════════════════════════════════════════════════════════════════

pub struct ReplicationSupervisor {
    worker_count: usize,
    replicator: Arc<dyn ContainerReplicator>,
    metrics: Arc<NodeAgentMetrics>,
    /// Containers queued or in flight. Guards against double-queueing.
    pending: Arc<Mutex<HashSet<u64>>>,
    tx: Mutex<Option<mpsc::UnboundedSender<ReplicationJob>>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ReplicationJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl ReplicationSupervisor {
    pub fn new(
        worker_count: usize,
        replicator: Arc<dyn ContainerReplicator>,
        metrics: Arc<NodeAgentMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            worker_count,
            replicator,
            metrics,
            pending: Arc::new(Mutex::new(HashSet::new())),
            tx: Mutex::new(Some(tx)),
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            workers: Mutex::new(Vec::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Spawn the worker pool. Jobs submitted before `start` wait in the
    /// queue. Calling twice is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut workers = self.workers.lock();
        for worker_id in 0..self.worker_count {
            let rx = Arc::clone(&self.rx);
            let pending = Arc::clone(&self.pending);
            let replicator = Arc::clone(&self.replicator);
            let stopping = Arc::clone(&self.stopping);
            workers.push(tokio::spawn(async move {
                loop {
                    if stopping.load(Ordering::Acquire) {
                        break;
                    }
                    // Single consumer at a time; the channel closes when
                    // the supervisor stops, draining every worker.
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    if stopping.load(Ordering::Acquire) {
                        pending.lock().remove(&job.container_id);
                        break;
                    }
                    debug!(
                        worker_id,
                        container_id = job.container_id,
                        "replication job started"
                    );
                    match replicator.replicate(&job).await {
                        Ok(bytes) => {
                            info!(
                                container_id = job.container_id,
                                bytes, "replication job finished"
                            );
                        }
                        Err(e) => {
                            warn!(
                                container_id = job.container_id,
                                error = %e,
                                "replication job failed"
                            );
                        }
                    }
                    pending.lock().remove(&job.container_id);
                }
            }));
        }
    }

    /// Submit a job. Returns false when the job was not accepted: the
    /// container is already queued/in flight, or the supervisor is
    /// stopping.
    pub fn add_task(&self, job: ReplicationJob) -> bool {
        if self.stopping.load(Ordering::Acquire) {
            warn!(
                container_id = job.container_id,
                "replication supervisor stopping, job refused"
            );
            return false;
        }
        if !self.pending.lock().insert(job.container_id) {
            debug!(
                container_id = job.container_id,
                "container already queued or in flight, skipping"
            );
            self.metrics.record_replication_skipped();
            return false;
        }
        let container_id = job.container_id;
        let sent = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        };
        if sent {
            self.metrics.record_replication_requested();
        } else {
            self.pending.lock().remove(&container_id);
        }
        sent
    }

    /// Containers currently queued or in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Stop the pool. In-flight jobs get `grace` to finish, then are
    /// forcibly cancelled; the call always returns within roughly the
    /// grace period. Safe to call more than once.
    pub async fn stop(&self, grace: Duration) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stopping.store(true, Ordering::Release);
        // Closing the channel drains idle workers.
        self.tx.lock().take();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if timeout(grace, join_all(handles)).await.is_err() {
            warn!("replication workers did not finish in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        self.pending.lock().clear();
    }
}
