//! Error types for pricestream using snafu.
//!
//! Each concern owns an error enum with context selectors. `PipelineError`
//! aggregates them at the orchestration boundary.

use snafu::prelude::*;

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },

    /// GCS configuration error.
    #[snafu(display("GCS configuration error: {source}"))]
    GcsConfig { source: object_store::Error },

    /// Azure configuration error.
    #[snafu(display("Azure configuration error: {source}"))]
    AzureConfig { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Catalog path is empty.
    #[snafu(display("Catalog path cannot be empty"))]
    EmptyCatalogPath,

    /// Staging URL is empty.
    #[snafu(display("Staging URL cannot be empty"))]
    EmptyStagingUrl,

    /// Warehouse URL is empty.
    #[snafu(display("Warehouse URL cannot be empty"))]
    EmptyWarehouseUrl,

    /// The warehouse URL points at a backend the table layer cannot commit to.
    #[snafu(display("Warehouse URL {url} uses a backend without Delta support (use S3, GCS or a local path)"))]
    UnsupportedWarehouseBackend { url: String },

    /// A numeric setting that must be positive was zero.
    #[snafu(display("{field} must be greater than zero"))]
    ZeroSetting { field: &'static str },

    /// A marketplace references a currency with no fallback rate.
    #[snafu(display("Marketplace {marketplace} uses currency {currency} which has no fallback rate"))]
    MissingFallbackRate {
        marketplace: String,
        currency: String,
    },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },
}

// ============ Catalog Errors ============

/// Errors that can occur while loading the identifier catalog.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CatalogError {
    /// Failed to open the storage location holding the catalog.
    #[snafu(display("Failed to open catalog storage for {path}: {source}"))]
    CatalogStorage { path: String, source: StorageError },

    /// Failed to read the catalog document.
    #[snafu(display("Failed to read catalog {path}: {source}"))]
    CatalogRead { path: String, source: StorageError },

    /// Catalog document is not valid JSON in the expected shape.
    #[snafu(display("Failed to decode catalog {path}: {source}"))]
    CatalogDecode {
        path: String,
        source: serde_json::Error,
    },
}

// ============ Fetch Errors ============

/// Errors raised by the remote price API client.
///
/// Only `MissingApiKey` and `ClientBuild` escape a run; the rest are
/// retried and then folded into a failed fetch outcome.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FetchError {
    /// No usable API credential was configured.
    #[snafu(display("API key is not set"))]
    MissingApiKey,

    /// Failed to build the HTTP client.
    #[snafu(display("Failed to build HTTP client: {source}"))]
    ClientBuild { source: reqwest::Error },

    /// Transport-level failure.
    #[snafu(display("Request failed: {source}"))]
    Http { source: reqwest::Error },

    /// Non-success HTTP status.
    #[snafu(display("Unexpected HTTP status {status}"))]
    Status { status: u16 },

    /// The API answered with an error payload.
    #[snafu(display("API error: {message}"))]
    Api { message: String },

    /// Response body could not be decoded.
    #[snafu(display("Failed to decode response: {source}"))]
    Decode { source: reqwest::Error },
}

// ============ Transform Errors ============

/// Reasons a single raw item is skipped during transformation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransformError {
    /// Item did not match the expected product shape.
    #[snafu(display("Malformed product: {source}"))]
    Malformed { source: serde_json::Error },

    /// Item has no identifier.
    #[snafu(display("Product has no identifier"))]
    MissingIdentifier,

    /// Item has no statistics block.
    #[snafu(display("Product {identifier} has no stats"))]
    MissingStats { identifier: String },

    /// A required text column was empty.
    #[snafu(display("Record field {field} cannot be empty"))]
    EmptyField { field: &'static str },

    /// A numeric value is not usable.
    #[snafu(display("Record field {field} has invalid value {value}"))]
    InvalidValue { field: &'static str, value: f64 },
}

// ============ Parquet Errors ============

/// Errors that can occur during Parquet file writing.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ParquetError {
    /// Parquet write error.
    #[snafu(display("Parquet write error: {source}"))]
    Write {
        source: deltalake::parquet::errors::ParquetError,
    },

    /// Failed to create Parquet writer.
    #[snafu(display("Failed to create Parquet writer: {source}"))]
    WriterCreate {
        source: deltalake::parquet::errors::ParquetError,
    },

    /// Failed to assemble the Arrow record batch.
    #[snafu(display("Failed to build record batch: {source}"))]
    RecordBatch {
        source: deltalake::arrow::error::ArrowError,
    },

    /// Failed to create or access the local staging file.
    #[snafu(display("Staging file error for {path}: {source}"))]
    StagingFile {
        path: String,
        source: std::io::Error,
    },
}

// ============ Sink Errors ============

/// Errors raised by the streaming segment writer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// Encoding the segment failed.
    #[snafu(display("Failed to encode segment: {source}"))]
    Encode { source: ParquetError },

    /// Reading the encoded segment back for upload failed.
    #[snafu(display("Failed to read staged segment {path}: {source}"))]
    ReadStaged {
        path: String,
        source: std::io::Error,
    },

    /// Uploading the segment failed.
    #[snafu(display("Failed to upload segment {path}: {source}"))]
    Upload { path: String, source: StorageError },
}

// ============ Checkpoint Errors ============

/// Errors raised by the checkpoint store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    /// Reading the checkpoint failed for a reason other than absence.
    #[snafu(display("Failed to read checkpoint {path}: {source}"))]
    CheckpointRead { path: String, source: StorageError },

    /// Writing the checkpoint failed.
    #[snafu(display("Failed to write checkpoint {path}: {source}"))]
    CheckpointWrite { path: String, source: StorageError },

    /// Deleting the checkpoint failed for a reason other than absence.
    #[snafu(display("Failed to delete checkpoint {path}: {source}"))]
    CheckpointDelete { path: String, source: StorageError },

    /// Checkpoint exists but could not be decoded.
    #[snafu(display("Failed to decode checkpoint {path}: {source}"))]
    CheckpointDecode {
        path: String,
        source: serde_json::Error,
    },

    /// Checkpoint could not be encoded.
    #[snafu(display("Failed to encode checkpoint: {source}"))]
    CheckpointEncode { source: serde_json::Error },
}

// ============ Delta Errors ============

/// Errors that can occur during Delta Lake operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DeltaError {
    /// Failed to parse Delta table URL.
    #[snafu(display("Failed to parse Delta table URL: {url}"))]
    UrlParse { url: String },

    /// Delta Lake operation failed.
    #[snafu(display("Delta Lake operation failed: {source}"))]
    DeltaOperation { source: deltalake::DeltaTableError },

    /// Failed to extract struct type from schema.
    #[snafu(display("Failed to extract struct type from schema: {message}"))]
    StructType { message: String },

    /// Failed to convert schema.
    #[snafu(display("Failed to convert schema: {source}"))]
    SchemaConversion {
        source: deltalake::arrow::error::ArrowError,
    },

    /// Storage error while staging table files.
    #[snafu(display("Failed to copy {path} into the table: {source}"))]
    CopySegment { path: String, source: StorageError },

    /// File size does not fit the Delta action field.
    #[snafu(display("File size {size} for {path} is out of range"))]
    FileSize { path: String, size: usize },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder: {source}"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ Service Errors ============

/// Errors from the HTTP trigger service.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ServiceError {
    /// Failed to bind the listener.
    #[snafu(display("Failed to bind {address}: {source}"))]
    Bind {
        address: String,
        source: std::io::Error,
    },

    /// The server stopped with an error.
    #[snafu(display("Server error: {source}"))]
    Serve { source: std::io::Error },
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Storage error.
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    /// Catalog error.
    #[snafu(display("Catalog error: {source}"))]
    Catalog { source: CatalogError },

    /// Fatal fetch error (credentials or client setup).
    #[snafu(display("Fetch error: {source}"))]
    Fetch { source: FetchError },

    /// Segment writer error.
    #[snafu(display("Sink error: {source}"))]
    Sink { source: SinkError },

    /// Checkpoint error.
    #[snafu(display("Checkpoint error: {source}"))]
    Checkpoint { source: CheckpointError },

    /// Failed to parse an address.
    #[snafu(display("Failed to parse address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },

    /// Service error.
    #[snafu(display("Service error: {source}"))]
    Service { source: ServiceError },
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        PipelineError::Storage { source }
    }
}

impl From<CatalogError> for PipelineError {
    fn from(source: CatalogError) -> Self {
        PipelineError::Catalog { source }
    }
}

impl From<FetchError> for PipelineError {
    fn from(source: FetchError) -> Self {
        PipelineError::Fetch { source }
    }
}

impl From<SinkError> for PipelineError {
    fn from(source: SinkError) -> Self {
        PipelineError::Sink { source }
    }
}

impl From<CheckpointError> for PipelineError {
    fn from(source: CheckpointError) -> Self {
        PipelineError::Checkpoint { source }
    }
}
