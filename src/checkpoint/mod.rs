//! Resumable progress tracking.
//!
//! The orchestrator saves `{"batch_offset": n}` after every batch and
//! removes it once a load has been confirmed. A rerun after a crash skips
//! the first `n` batches of the plan.
//!
//! Next to the checkpoint sits a [`SegmentManifest`] listing the segments
//! already uploaded by the unfinished run, so a resumed or retried run loads
//! them together with its own.

pub mod state;
pub mod traits;

pub use state::{CheckpointState, SegmentManifest};
pub use traits::CheckpointStore;

use async_trait::async_trait;
use object_store::path::Path;
use snafu::prelude::*;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::emit;
use crate::error::{
    CheckpointDecodeSnafu, CheckpointDeleteSnafu, CheckpointEncodeSnafu, CheckpointError,
    CheckpointReadSnafu, CheckpointWriteSnafu,
};
use crate::metrics::events::CheckpointSaved;
use crate::storage::StorageProviderRef;

/// File name of the manifest when no explicit path is configured.
pub const MANIFEST_FILE: &str = "segments.json";

/// Checkpoint stored as a JSON object in the staging storage.
#[derive(Debug, Clone)]
pub struct ObjectStoreCheckpoint {
    storage: StorageProviderRef,
    path: Path,
    manifest_path: Path,
}

impl ObjectStoreCheckpoint {
    /// The manifest defaults to [`MANIFEST_FILE`] in the checkpoint's directory.
    pub fn new(storage: StorageProviderRef, path: &str) -> Self {
        let manifest_path = match path.rsplit_once('/') {
            Some((dir, _)) => format!("{dir}/{MANIFEST_FILE}"),
            None => MANIFEST_FILE.to_string(),
        };
        Self {
            storage,
            path: Path::from(path),
            manifest_path: Path::from(manifest_path),
        }
    }

    pub fn with_manifest_path(mut self, manifest_path: &str) -> Self {
        self.manifest_path = Path::from(manifest_path);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    async fn delete(&self, path: &Path) -> Result<(), CheckpointError> {
        match self.storage.delete(path).await {
            Ok(()) => {
                info!(path = %path, "Cleared checkpoint object");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e).context(CheckpointDeleteSnafu {
                path: path.to_string(),
            }),
        }
    }
}

#[async_trait]
impl CheckpointStore for ObjectStoreCheckpoint {
    async fn load(&self) -> Result<CheckpointState, CheckpointError> {
        let path = self.path.to_string();
        let bytes = match self.storage.get(self.path.clone()).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                debug!(path, "No checkpoint found, starting from the first batch");
                return Ok(CheckpointState::default());
            }
            Err(e) => return Err(e).context(CheckpointReadSnafu { path }),
        };

        let state: CheckpointState =
            serde_json::from_slice(&bytes).context(CheckpointDecodeSnafu { path: &path })?;
        info!(path, batch_offset = state.batch_offset, "Loaded checkpoint");
        Ok(state)
    }

    async fn save(&self, state: CheckpointState) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec(&state).context(CheckpointEncodeSnafu)?;
        self.storage
            .put(self.path.clone(), bytes)
            .await
            .context(CheckpointWriteSnafu {
                path: self.path.to_string(),
            })?;

        emit!(CheckpointSaved {
            batch_offset: state.batch_offset
        });
        debug!(batch_offset = state.batch_offset, "Saved checkpoint");
        Ok(())
    }

    async fn load_manifest(&self) -> Result<Option<SegmentManifest>, CheckpointError> {
        let path = self.manifest_path.to_string();
        let bytes = match self.storage.get(self.manifest_path.clone()).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e).context(CheckpointReadSnafu { path }),
        };

        let manifest: SegmentManifest =
            serde_json::from_slice(&bytes).context(CheckpointDecodeSnafu { path: &path })?;
        info!(
            path,
            covered_offset = manifest.covered_offset,
            segments = manifest.segments.len(),
            "Loaded segment manifest"
        );
        Ok(Some(manifest))
    }

    async fn save_manifest(&self, manifest: &SegmentManifest) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec(manifest).context(CheckpointEncodeSnafu)?;
        self.storage
            .put(self.manifest_path.clone(), bytes)
            .await
            .context(CheckpointWriteSnafu {
                path: self.manifest_path.to_string(),
            })?;
        debug!(
            covered_offset = manifest.covered_offset,
            segments = manifest.segments.len(),
            "Saved segment manifest"
        );
        Ok(())
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        // A manifest without a checkpoint is ignored on the next run.
        self.delete(&self.path).await?;
        self.delete(&self.manifest_path).await
    }
}

/// In-process checkpoint that keeps every saved state.
///
/// Useful for dry runs and tests that assert on the save sequence.
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    current: Option<CheckpointState>,
    history: Vec<CheckpointState>,
    manifest: Option<SegmentManifest>,
    clears: usize,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing offset, as if a previous run had saved it.
    pub fn starting_at(batch_offset: u64) -> Self {
        let store = Self::new();
        if let Ok(mut inner) = store.inner.lock() {
            inner.current = Some(CheckpointState::at(batch_offset));
        }
        store
    }

    /// Seed a manifest left behind by a previous run.
    pub fn with_manifest(mut self, manifest: SegmentManifest) -> Self {
        if let Ok(inner) = self.inner.get_mut() {
            inner.manifest = Some(manifest);
        }
        self
    }

    pub fn current(&self) -> Option<CheckpointState> {
        self.inner.lock().ok().and_then(|inner| inner.current)
    }

    /// Offsets saved so far, in order.
    pub fn saved_offsets(&self) -> Vec<u64> {
        self.inner
            .lock()
            .map(|inner| inner.history.iter().map(|s| s.batch_offset).collect())
            .unwrap_or_default()
    }

    pub fn manifest(&self) -> Option<SegmentManifest> {
        self.inner.lock().ok().and_then(|inner| inner.manifest.clone())
    }

    pub fn clear_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.clears).unwrap_or(0)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoint {
    async fn load(&self) -> Result<CheckpointState, CheckpointError> {
        Ok(self.current().unwrap_or_default())
    }

    async fn save(&self, state: CheckpointState) -> Result<(), CheckpointError> {
        if let Ok(mut inner) = self.inner.lock() {
            inner.current = Some(state);
            inner.history.push(state);
        }
        Ok(())
    }

    async fn load_manifest(&self) -> Result<Option<SegmentManifest>, CheckpointError> {
        Ok(self.manifest())
    }

    async fn save_manifest(&self, manifest: &SegmentManifest) -> Result<(), CheckpointError> {
        if let Ok(mut inner) = self.inner.lock() {
            inner.manifest = Some(manifest.clone());
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        if let Ok(mut inner) = self.inner.lock() {
            inner.current = None;
            inner.manifest = None;
            inner.clears += 1;
        }
        Ok(())
    }
}
