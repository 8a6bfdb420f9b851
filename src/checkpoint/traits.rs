//! Checkpoint store abstraction.

use async_trait::async_trait;

use super::{CheckpointState, SegmentManifest};
use crate::error::CheckpointError;

/// Durable storage for the run's progress marker.
///
/// Implementations must treat an absent checkpoint as offset zero on
/// `load` and as success on `clear`. The segment manifest lives next to the
/// checkpoint and shares its lifetime.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<CheckpointState, CheckpointError>;

    /// Overwrite the stored state.
    async fn save(&self, state: CheckpointState) -> Result<(), CheckpointError>;

    async fn load_manifest(&self) -> Result<Option<SegmentManifest>, CheckpointError>;

    async fn save_manifest(&self, manifest: &SegmentManifest) -> Result<(), CheckpointError>;

    /// Remove the checkpoint, then the manifest.
    async fn clear(&self) -> Result<(), CheckpointError>;
}
