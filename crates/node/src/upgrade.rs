//! Upgrade Finalizer
//!
//! Drives the one-time layout-version upgrade workflow. The finalizer is
//! a small state machine of its own, gating first boot before the main
//! loop starts:
//!
//! ```text
//! ┌────────────┐ prefinalize  ┌─────────────┐  finalize()  ┌───────────┐
//! │ NotStarted │─────────────▶│ InProgress  │─────────────▶│ Finalized │
//! └────────────┘              └─────────────┘              └───────────┘
//!        │  prefinalize, marker already current                  ▲
//!        └───────────────────────────────────────────────────────┘
//! ```
//!
//! The persisted layout marker belongs to the storage layer; this module
//! only consumes it through [`LayoutVersionStore`]. `report_status()` is
//! idempotent and safe to call at any time, including concurrently with
//! `finalize()`.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

/// Layout version this build of the agent understands and, once
/// finalized, writes to the marker.
pub const SOFTWARE_LAYOUT_VERSION: u64 = 2;

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("layout store error: {0}")]
    Store(String),
    #[error("prefinalize actions have not run yet")]
    PrefinalizeNotRun,
    #[error(
        "on-disk layout version {on_disk} is newer than software version {software}; refusing to start"
    )]
    FutureLayout { on_disk: u64, software: u64 },
}

/// Access to the layout-version marker persisted by the storage layer.
pub trait LayoutVersionStore: Send + Sync {
    fn metadata_layout_version(&self) -> Result<u64, UpgradeError>;
    fn set_metadata_layout_version(&self, version: u64) -> Result<(), UpgradeError>;
}

/// Phases of the upgrade workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    NotStarted,
    InProgress,
    Finalized,
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpgradeState::NotStarted => "not_started",
            UpgradeState::InProgress => "in_progress",
            UpgradeState::Finalized => "finalized",
        };
        write!(f, "{}", name)
    }
}

/// Snapshot returned by `report_status` and `finalize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeStatus {
    pub state: UpgradeState,
    pub metadata_layout_version: u64,
    pub software_layout_version: u64,
}

pub struct UpgradeFinalizer {
    store: Arc<dyn LayoutVersionStore>,
    state: Mutex<UpgradeState>,
}

impl UpgradeFinalizer {
    pub fn new(store: Arc<dyn LayoutVersionStore>) -> Self {
        Self {
            store,
            state: Mutex::new(UpgradeState::NotStarted),
        }
    }

    /// Run once before the main loop starts. Decides whether this node
    /// is already at the software layout version (Finalized) or has a
    /// pending upgrade (InProgress) awaiting an administrative
    /// `finalize()`.
    pub fn run_prefinalize_actions(&self) -> Result<UpgradeStatus, UpgradeError> {
        let on_disk = self.store.metadata_layout_version()?;
        if on_disk > SOFTWARE_LAYOUT_VERSION {
            return Err(UpgradeError::FutureLayout {
                on_disk,
                software: SOFTWARE_LAYOUT_VERSION,
            });
        }
        let mut state = self.state.lock();
        *state = if on_disk == SOFTWARE_LAYOUT_VERSION {
            info!(layout_version = on_disk, "layout already finalized");
            UpgradeState::Finalized
        } else {
            warn!(
                on_disk,
                software = SOFTWARE_LAYOUT_VERSION,
                "layout upgrade pending finalization"
            );
            UpgradeState::InProgress
        };
        Ok(UpgradeStatus {
            state: *state,
            metadata_layout_version: on_disk,
            software_layout_version: SOFTWARE_LAYOUT_VERSION,
        })
    }

    /// Complete a pending upgrade. Idempotent once finalized; an error
    /// before prefinalize has run.
    pub fn finalize(&self) -> Result<UpgradeStatus, UpgradeError> {
        let mut state = self.state.lock();
        match *state {
            UpgradeState::NotStarted => Err(UpgradeError::PrefinalizeNotRun),
            UpgradeState::Finalized => Ok(UpgradeStatus {
                state: UpgradeState::Finalized,
                metadata_layout_version: self.store.metadata_layout_version()?,
                software_layout_version: SOFTWARE_LAYOUT_VERSION,
            }),
            UpgradeState::InProgress => {
                self.store
                    .set_metadata_layout_version(SOFTWARE_LAYOUT_VERSION)?;
                *state = UpgradeState::Finalized;
                info!(
                    layout_version = SOFTWARE_LAYOUT_VERSION,
                    "layout upgrade finalized"
                );
                Ok(UpgradeStatus {
                    state: UpgradeState::Finalized,
                    metadata_layout_version: SOFTWARE_LAYOUT_VERSION,
                    software_layout_version: SOFTWARE_LAYOUT_VERSION,
                })
            }
        }
    }

    /// Current phase and versions. Never mutates state.
    pub fn report_status(&self) -> Result<UpgradeStatus, UpgradeError> {
        Ok(UpgradeStatus {
            state: *self.state.lock(),
            metadata_layout_version: self.store.metadata_layout_version()?,
            software_layout_version: SOFTWARE_LAYOUT_VERSION,
        })
    }
}

/// In-memory layout store for tests and the demo binary.
pub struct InMemoryLayoutStore {
    version: Mutex<u64>,
}

impl InMemoryLayoutStore {
    pub fn at_version(version: u64) -> Self {
        Self {
            version: Mutex::new(version),
        }
    }
}

impl LayoutVersionStore for InMemoryLayoutStore {
    fn metadata_layout_version(&self) -> Result<u64, UpgradeError> {
        Ok(*self.version.lock())
    }

    fn set_metadata_layout_version(&self, version: u64) -> Result<(), UpgradeError> {
        *self.version.lock() = version;
        Ok(())
    }
}

/// Layout store persisting the marker as a single-line text file, for
/// deployments where the hosting process does not bring its own store.
pub struct FileLayoutStore {
    path: std::path::PathBuf,
}

impl FileLayoutStore {
    /// Opens (and seeds, if absent) the marker under `dir`.
    pub fn open(dir: &std::path::Path, initial_version: u64) -> Result<Self, UpgradeError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| UpgradeError::Store(format!("create {}: {}", dir.display(), e)))?;
        let path = dir.join("layout_version");
        if !path.exists() {
            std::fs::write(&path, format!("{}\n", initial_version))
                .map_err(|e| UpgradeError::Store(format!("seed {}: {}", path.display(), e)))?;
        }
        Ok(Self { path })
    }
}

impl LayoutVersionStore for FileLayoutStore {
    fn metadata_layout_version(&self) -> Result<u64, UpgradeError> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| UpgradeError::Store(format!("read {}: {}", self.path.display(), e)))?;
        raw.trim()
            .parse()
            .map_err(|e| UpgradeError::Store(format!("parse {}: {}", self.path.display(), e)))
    }

    fn set_metadata_layout_version(&self, version: u64) -> Result<(), UpgradeError> {
        std::fs::write(&self.path, format!("{}\n", version))
            .map_err(|e| UpgradeError::Store(format!("write {}: {}", self.path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_layout_is_finalized_immediately() {
        let store = Arc::new(InMemoryLayoutStore::at_version(SOFTWARE_LAYOUT_VERSION));
        let finalizer = UpgradeFinalizer::new(store);
        let status = finalizer.run_prefinalize_actions().expect("prefinalize");
        assert_eq!(status.state, UpgradeState::Finalized);
        // finalize() on an already finalized node is a no-op success.
        let status = finalizer.finalize().expect("finalize");
        assert_eq!(status.state, UpgradeState::Finalized);
    }

    #[test]
    fn pending_upgrade_finalizes_and_persists() {
        let store = Arc::new(InMemoryLayoutStore::at_version(1));
        let finalizer = UpgradeFinalizer::new(Arc::clone(&store) as Arc<dyn LayoutVersionStore>);
        let status = finalizer.run_prefinalize_actions().expect("prefinalize");
        assert_eq!(status.state, UpgradeState::InProgress);
        assert_eq!(status.metadata_layout_version, 1);

        let status = finalizer.finalize().expect("finalize");
        assert_eq!(status.state, UpgradeState::Finalized);
        assert_eq!(
            store.metadata_layout_version().expect("version"),
            SOFTWARE_LAYOUT_VERSION
        );
        // Idempotent.
        assert_eq!(
            finalizer.finalize().expect("finalize again").state,
            UpgradeState::Finalized
        );
    }

    #[test]
    fn finalize_before_prefinalize_is_an_error() {
        let finalizer = UpgradeFinalizer::new(Arc::new(InMemoryLayoutStore::at_version(1)));
        assert!(matches!(
            finalizer.finalize(),
            Err(UpgradeError::PrefinalizeNotRun)
        ));
    }

    #[test]
    fn future_layout_refused() {
        let finalizer = UpgradeFinalizer::new(Arc::new(InMemoryLayoutStore::at_version(
            SOFTWARE_LAYOUT_VERSION + 1,
        )));
        assert!(matches!(
            finalizer.run_prefinalize_actions(),
            Err(UpgradeError::FutureLayout { .. })
        ));
    }

    #[test]
    fn report_status_is_idempotent() {
        let finalizer = UpgradeFinalizer::new(Arc::new(InMemoryLayoutStore::at_version(1)));
        // Safe before prefinalize.
        let s1 = finalizer.report_status().expect("status");
        assert_eq!(s1.state, UpgradeState::NotStarted);
        finalizer.run_prefinalize_actions().expect("prefinalize");
        let s2 = finalizer.report_status().expect("status");
        let s3 = finalizer.report_status().expect("status");
        assert_eq!(s2, s3);
    }

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileLayoutStore::open(dir.path(), 1).expect("open");
        assert_eq!(store.metadata_layout_version().expect("read"), 1);
        store.set_metadata_layout_version(2).expect("write");
        assert_eq!(store.metadata_layout_version().expect("read"), 2);
        // Reopening sees the persisted value, not the seed.
        let reopened = FileLayoutStore::open(dir.path(), 1).expect("reopen");
        assert_eq!(reopened.metadata_layout_version().expect("read"), 2);
    }
}
