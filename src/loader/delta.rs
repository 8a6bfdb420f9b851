//! Delta Lake bulk loader.
//!
//! Segments are copied from the staging storage into the table directory
//! and then added to the table in one `Write { mode: Append }` commit.

use async_trait::async_trait;
use deltalake::DeltaTable;
use deltalake::kernel::{Action, Add};
use deltalake::protocol::SaveMode;
use futures::{StreamExt, TryStreamExt};
use object_store::PutPayload;
use object_store::path::Path;
use snafu::prelude::*;
use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

use super::table::{ensure_handlers_registered, load_or_create_table};
use super::{BulkLoader, LoadOutcome};
use crate::emit;
use crate::error::{CopySegmentSnafu, DeltaError, FileSizeSnafu};
use crate::metrics::events::{LoadCompleted, LoadStatus};
use crate::sink::{UploadedSegment, price_schema};
use crate::storage::StorageProviderRef;

/// Columns the table keeps file statistics for.
pub const CLUSTER_COLUMNS: [&str; 2] = ["identifier", "marketplace"];

/// Appends staged segments to a Delta Lake table.
pub struct DeltaLoader {
    staging: StorageProviderRef,
    table_storage: StorageProviderRef,
    table_name: String,
    max_concurrent_copies: usize,
}

impl DeltaLoader {
    pub fn new(
        staging: StorageProviderRef,
        table_storage: StorageProviderRef,
        table_name: impl Into<String>,
        max_concurrent_copies: usize,
    ) -> Self {
        ensure_handlers_registered();
        Self {
            staging,
            table_storage,
            table_name: table_name.into(),
            max_concurrent_copies: max_concurrent_copies.max(1),
        }
    }

    /// Table-relative name of a copied segment.
    fn table_file_name(segment: &UploadedSegment) -> String {
        segment
            .path
            .rsplit('/')
            .next()
            .unwrap_or(segment.path.as_str())
            .to_string()
    }

    /// Copy one segment into the table directory and describe it as an Add action.
    async fn copy_segment(&self, segment: &UploadedSegment) -> Result<Action, DeltaError> {
        let bytes = self
            .staging
            .get(segment.path.as_str())
            .await
            .context(CopySegmentSnafu {
                path: segment.path.as_str(),
            })?;
        let size = bytes.len();
        let name = Self::table_file_name(segment);

        self.table_storage
            .put_parquet(&Path::from(name.as_str()), PutPayload::from(bytes))
            .await
            .context(CopySegmentSnafu {
                path: segment.path.as_str(),
            })?;
        debug!(source = %segment.uri, target = %name, bytes = size, "Copied segment into table");

        create_add_action(&name, size)
    }

    async fn commit(&self, table: &DeltaTable, actions: Vec<Action>) -> Result<i64, DeltaError> {
        use deltalake::kernel::transaction::CommitBuilder;

        let version = CommitBuilder::default()
            .with_actions(actions)
            .build(
                Some(
                    table
                        .snapshot()
                        .map_err(|source| DeltaError::DeltaOperation { source })?,
                ),
                table.log_store(),
                deltalake::protocol::DeltaOperation::Write {
                    mode: SaveMode::Append,
                    partition_by: None,
                    predicate: None,
                },
            )
            .await
            .map_err(|source| DeltaError::DeltaOperation { source })?
            .version;

        Ok(version)
    }

    async fn try_load(&self, segments: &[UploadedSegment]) -> Result<i64, DeltaError> {
        let stats_columns: Vec<String> = CLUSTER_COLUMNS.iter().map(|c| c.to_string()).collect();
        let table = load_or_create_table(
            &self.table_storage,
            &price_schema(),
            &self.table_name,
            &stats_columns,
        )
        .await?;

        let copies: Vec<_> = segments
            .iter()
            .map(|segment| self.copy_segment(segment))
            .collect();
        let actions: Vec<Action> = futures::stream::iter(copies)
            .buffer_unordered(self.max_concurrent_copies)
            .try_collect()
            .await?;

        self.commit(&table, actions).await
    }
}

/// Create a Delta Lake Add action for a file at the table root.
fn create_add_action(path: &str, size: usize) -> Result<Action, DeltaError> {
    let size = i64::try_from(size).map_err(|_| {
        FileSizeSnafu {
            path: path.to_string(),
            size,
        }
        .build()
    })?;
    let modification_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| i64::try_from(d.as_millis()).ok())
        .unwrap_or(0);

    Ok(Action::Add(Add {
        path: path.to_string(),
        size,
        partition_values: HashMap::new(),
        modification_time,
        data_change: true,
        ..Default::default()
    }))
}

#[async_trait]
impl BulkLoader for DeltaLoader {
    async fn load(&self, segments: &[UploadedSegment]) -> LoadOutcome {
        if segments.is_empty() {
            info!(table = %self.table_name, "No segments to load");
            emit!(LoadCompleted {
                status: LoadStatus::Empty,
                rows: 0,
                duration: std::time::Duration::ZERO,
            });
            return LoadOutcome::NothingToLoad;
        }

        let start = Instant::now();
        let rows: u64 = segments.iter().map(|s| s.record_count as u64).sum();

        match self.try_load(segments).await {
            Ok(version) => {
                info!(
                    table = %self.table_name,
                    files = segments.len(),
                    rows,
                    version,
                    "Loaded segments into table"
                );
                emit!(LoadCompleted {
                    status: LoadStatus::Loaded,
                    rows,
                    duration: start.elapsed(),
                });
                LoadOutcome::Loaded { rows, version }
            }
            Err(e) => {
                error!(table = %self.table_name, files = segments.len(), error = %e, "Load failed");
                emit!(LoadCompleted {
                    status: LoadStatus::Failed,
                    rows: 0,
                    duration: start.elapsed(),
                });
                LoadOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}
