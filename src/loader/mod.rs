//! Bulk load of staged segments into the warehouse table.
//!
//! One load is one append-only job: either every segment of the run lands
//! in a single table commit or nothing does.

pub mod delta;
pub mod table;

use async_trait::async_trait;

use crate::sink::UploadedSegment;

pub use delta::DeltaLoader;

/// Result of a load job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No segments were given; nothing was touched.
    NothingToLoad,
    /// All segments were committed in table version `version`.
    Loaded { rows: u64, version: i64 },
    /// The job failed and nothing was committed.
    Failed { reason: String },
}

impl LoadOutcome {
    /// Rows appended to the table; zero for failures and empty loads.
    pub fn rows_loaded(&self) -> u64 {
        match self {
            LoadOutcome::Loaded { rows, .. } => *rows,
            LoadOutcome::NothingToLoad | LoadOutcome::Failed { .. } => 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LoadOutcome::Failed { .. })
    }
}

/// Loads a run's segments into the warehouse.
///
/// Failures are reported through [`LoadOutcome::Failed`], never raised.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    async fn load(&self, segments: &[UploadedSegment]) -> LoadOutcome;
}
