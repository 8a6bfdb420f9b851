//! Streaming segment writer.
//!
//! Records accumulate in one open segment. When it reaches `flush_rows`
//! the segment is encoded, uploaded to the staging storage and replaced by
//! an empty one, so at most `flush_rows` records are ever held in memory.

use chrono::NaiveDate;
use object_store::PutPayload;
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::parquet::ParquetFileWriter;
use super::{price_schema, records_to_batch};
use crate::config::ParquetCompression;
use crate::emit;
use crate::error::{EncodeSnafu, ReadStagedSnafu, SinkError, UploadSnafu};
use crate::metrics::events::{OpenSegmentRecords, SegmentUploaded};
use crate::storage::StorageProviderRef;
use crate::transform::PriceRecord;

/// A segment that has been written to staging storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedSegment {
    /// Fully qualified URL of the object.
    pub uri: String,
    /// Path relative to the staging storage root.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    pub record_count: usize,
}

/// Settings for [`SegmentWriter`].
#[derive(Debug, Clone)]
pub struct SegmentWriterConfig {
    /// Object path prefix, e.g. `price_data`.
    pub prefix: String,
    /// Date component of the object path.
    pub run_date: NaiveDate,
    /// Records per segment.
    pub flush_rows: usize,
    /// Where segments are encoded before upload.
    pub local_dir: PathBuf,
    pub compression: ParquetCompression,
}

pub struct SegmentWriter {
    storage: StorageProviderRef,
    config: SegmentWriterConfig,
    encoder: ParquetFileWriter,
    open: Vec<PriceRecord>,
    uploaded: Vec<UploadedSegment>,
}

impl SegmentWriter {
    pub fn new(storage: StorageProviderRef, config: SegmentWriterConfig) -> Self {
        let flush_rows = config.flush_rows.max(1);
        let encoder = ParquetFileWriter::new(price_schema(), config.compression);
        Self {
            storage,
            config: SegmentWriterConfig {
                flush_rows,
                ..config
            },
            encoder,
            open: Vec::with_capacity(flush_rows),
            uploaded: Vec::new(),
        }
    }

    /// Append records, flushing each time the open segment fills up.
    pub async fn write_batch(&mut self, records: Vec<PriceRecord>) -> Result<(), SinkError> {
        for record in records {
            self.open.push(record);
            if self.open.len() >= self.config.flush_rows {
                self.flush_and_rotate().await?;
            }
        }
        emit!(OpenSegmentRecords {
            count: self.open.len()
        });
        Ok(())
    }

    /// Upload the open segment and start a new one.
    ///
    /// Returns `None` when the open segment is empty. On error the open
    /// segment is left untouched.
    pub async fn flush_and_rotate(&mut self) -> Result<Option<UploadedSegment>, SinkError> {
        if self.open.is_empty() {
            return Ok(None);
        }

        let segment = self.upload(&self.open).await?;
        self.open.clear();
        info!(
            uri = %segment.uri,
            rows = segment.record_count,
            bytes = segment.size,
            "Uploaded segment"
        );
        self.uploaded.push(segment.clone());
        Ok(Some(segment))
    }

    /// Flush the final partial segment and return every segment of the run
    /// in upload order.
    pub async fn close(mut self) -> Result<Vec<UploadedSegment>, SinkError> {
        self.flush_and_rotate().await?;
        emit!(OpenSegmentRecords { count: 0 });
        Ok(self.uploaded)
    }

    /// Records in the open segment.
    pub fn open_records(&self) -> usize {
        self.open.len()
    }

    pub fn uploaded(&self) -> &[UploadedSegment] {
        &self.uploaded
    }

    async fn upload(&self, records: &[PriceRecord]) -> Result<UploadedSegment, SinkError> {
        let id = Uuid::now_v7();
        let local_path = self.config.local_dir.join(format!("{id}.parquet"));
        let object_path = format!(
            "{}/{}/{}.parquet",
            self.config.prefix.trim_matches('/'),
            self.config.run_date.format("%Y-%m-%d"),
            id
        );

        let result = self.encode_and_put(records, &local_path, &object_path).await;
        match tokio::fs::remove_file(&local_path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                warn!(path = %local_path.display(), error = %e, "Failed to remove staged segment");
            }
            _ => {}
        }
        let size = result?;

        emit!(SegmentUploaded {
            bytes: size,
            records: records.len() as u64,
        });

        Ok(UploadedSegment {
            uri: self.storage.url_for(&Path::from(object_path.as_str())),
            path: object_path,
            size,
            record_count: records.len(),
        })
    }

    async fn encode_and_put(
        &self,
        records: &[PriceRecord],
        local_path: &std::path::Path,
        object_path: &str,
    ) -> Result<u64, SinkError> {
        let batch = records_to_batch(records).context(EncodeSnafu)?;
        let size = self
            .encoder
            .write_file(local_path, &batch)
            .context(EncodeSnafu)?;
        debug!(path = %local_path.display(), bytes = size, "Encoded segment");

        let bytes = tokio::fs::read(local_path).await.context(ReadStagedSnafu {
            path: local_path.display().to_string(),
        })?;
        self.storage
            .put_parquet(&Path::from(object_path), PutPayload::from(bytes))
            .await
            .context(UploadSnafu { path: object_path })?;
        Ok(size)
    }
}
