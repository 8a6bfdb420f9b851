//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============================================================================
// Remote API
// ============================================================================

/// Status of a single HTTP request to the price API.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted for every HTTP attempt against the price API.
pub struct ApiRequest {
    pub status: RequestStatus,
    pub duration: Duration,
}

impl InternalEvent for ApiRequest {
    fn emit(self) {
        trace!(
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "API request"
        );
        counter!("pricestream_api_requests_total", "status" => self.status.as_str()).increment(1);
        histogram!("pricestream_api_request_duration_seconds")
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a batch fetch is retried after a transient failure.
pub struct FetchRetried {
    pub attempt: u32,
    pub delay: Duration,
}

impl InternalEvent for FetchRetried {
    fn emit(self) {
        trace!(
            attempt = self.attempt,
            delay_ms = self.delay.as_millis(),
            "Fetch retried"
        );
        counter!("pricestream_fetch_retries_total").increment(1);
    }
}

/// Final state of one batch fetch.
#[derive(Debug, Clone, Copy)]
pub enum BatchStatus {
    Fetched,
    Failed,
}

impl BatchStatus {
    fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Fetched => "fetched",
            BatchStatus::Failed => "failed",
        }
    }
}

/// Event emitted once a batch is fully processed.
pub struct BatchProcessed {
    pub status: BatchStatus,
}

impl InternalEvent for BatchProcessed {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Batch processed");
        counter!("pricestream_batches_processed_total", "status" => self.status.as_str())
            .increment(1);
    }
}

// ============================================================================
// Transform
// ============================================================================

/// Event emitted when raw items become output records.
pub struct RecordsTransformed {
    pub count: u64,
}

impl InternalEvent for RecordsTransformed {
    fn emit(self) {
        trace!(count = self.count, "Records transformed");
        counter!("pricestream_records_transformed_total").increment(self.count);
    }
}

/// Event emitted when malformed items are dropped.
pub struct ItemsSkipped {
    pub count: u64,
}

impl InternalEvent for ItemsSkipped {
    fn emit(self) {
        trace!(count = self.count, "Items skipped");
        counter!("pricestream_items_skipped_total").increment(self.count);
    }
}

// ============================================================================
// Segments
// ============================================================================

/// Event emitted when a Parquet segment has been encoded.
pub struct ParquetWriteCompleted {
    pub duration: Duration,
}

impl InternalEvent for ParquetWriteCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            "Parquet write completed"
        );
        histogram!("pricestream_parquet_write_duration_seconds")
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a segment lands in object storage.
pub struct SegmentUploaded {
    pub bytes: u64,
    pub records: u64,
}

impl InternalEvent for SegmentUploaded {
    fn emit(self) {
        trace!(
            bytes = self.bytes,
            records = self.records,
            "Segment uploaded"
        );
        counter!("pricestream_segments_uploaded_total").increment(1);
        counter!("pricestream_segment_bytes_total").increment(self.bytes);
        counter!("pricestream_segment_records_total").increment(self.records);
    }
}

/// Event emitted with the number of records held by the open segment.
pub struct OpenSegmentRecords {
    pub count: usize,
}

impl InternalEvent for OpenSegmentRecords {
    fn emit(self) {
        trace!(count = self.count, "Open segment records");
        gauge!("pricestream_open_segment_records").set(self.count as f64);
    }
}

// ============================================================================
// Checkpoint, load, and run
// ============================================================================

/// Event emitted after the checkpoint is persisted.
pub struct CheckpointSaved {
    pub batch_offset: u64,
}

impl InternalEvent for CheckpointSaved {
    fn emit(self) {
        trace!(batch_offset = self.batch_offset, "Checkpoint saved");
        counter!("pricestream_checkpoints_saved_total").increment(1);
        gauge!("pricestream_checkpoint_batch_offset").set(self.batch_offset as f64);
    }
}

/// Result of a bulk load job.
#[derive(Debug, Clone, Copy)]
pub enum LoadStatus {
    Loaded,
    Empty,
    Failed,
}

impl LoadStatus {
    fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Loaded => "loaded",
            LoadStatus::Empty => "empty",
            LoadStatus::Failed => "failed",
        }
    }
}

/// Event emitted when a bulk load job finishes.
pub struct LoadCompleted {
    pub status: LoadStatus,
    pub rows: u64,
    pub duration: Duration,
}

impl InternalEvent for LoadCompleted {
    fn emit(self) {
        trace!(
            status = self.status.as_str(),
            rows = self.rows,
            duration_ms = self.duration.as_millis(),
            "Load completed"
        );
        counter!("pricestream_loads_total", "status" => self.status.as_str()).increment(1);
        counter!("pricestream_rows_loaded_total").increment(self.rows);
        histogram!("pricestream_load_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Where the run's currency table came from.
#[derive(Debug, Clone, Copy)]
pub enum FxSource {
    Live,
    Fallback,
}

impl FxSource {
    fn as_str(&self) -> &'static str {
        match self {
            FxSource::Live => "live",
            FxSource::Fallback => "fallback",
        }
    }
}

/// Event emitted once the currency table is resolved.
pub struct FxRatesResolved {
    pub source: FxSource,
}

impl InternalEvent for FxRatesResolved {
    fn emit(self) {
        trace!(source = self.source.as_str(), "FX rates resolved");
        counter!("pricestream_fx_resolutions_total", "source" => self.source.as_str())
            .increment(1);
    }
}

/// Event emitted when a pipeline run ends.
pub struct RunCompleted {
    pub result: &'static str,
    pub duration: Duration,
}

impl InternalEvent for RunCompleted {
    fn emit(self) {
        trace!(
            result = self.result,
            duration_ms = self.duration.as_millis(),
            "Run completed"
        );
        counter!("pricestream_runs_total", "result" => self.result).increment(1);
        histogram!("pricestream_run_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a run starts or stops.
pub struct RunInProgress {
    pub running: bool,
}

impl InternalEvent for RunInProgress {
    fn emit(self) {
        gauge!("pricestream_run_in_progress").set(if self.running { 1.0 } else { 0.0 });
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Type of storage operation.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    Delete,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::Delete => "delete",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "pricestream_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when a storage request completes with duration.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request duration"
        );
        histogram!(
            "pricestream_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}
