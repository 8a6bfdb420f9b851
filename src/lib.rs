//! pricestream: checkpointed daily marketplace price ingestion.
//!
//! This library plans batches over an identifier catalog, fetches current
//! price statistics from the Keepa API, normalises them to USD, streams them
//! into Parquet segments in object storage and appends the segments to a
//! Delta Lake table. Progress is checkpointed after every batch so a crashed
//! run resumes where it stopped.
//!
//! # Example
//!
//! ```ignore
//! use pricestream::{Config, run_pipeline, error::PipelineError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PipelineError> {
//!     let config = Config::from_file("config.yaml")?;
//!     let report = run_pipeline(&config).await?;
//!     println!("Loaded {} rows", report.rows_loaded);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod fetch;
pub mod fx;
pub mod loader;
pub mod metrics;
pub mod pipeline;
pub mod planner;
pub mod service;
pub mod signal;
pub mod sink;
pub mod storage;
pub mod transform;

// Re-export main types
pub use config::Config;
pub use pipeline::{Pipeline, RunOutcome, RunReport, run_pipeline};
pub use storage::{StorageProvider, StorageProviderRef};
