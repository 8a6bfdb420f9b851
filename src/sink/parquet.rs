//! Parquet encoding of segments.
//!
//! Each segment becomes a single Parquet file in a local staging directory
//! before it is uploaded.

use deltalake::arrow::array::RecordBatch;
use deltalake::arrow::datatypes::SchemaRef;
use deltalake::parquet::arrow::ArrowWriter;
use deltalake::parquet::basic::{Compression, GzipLevel, ZstdLevel};
use deltalake::parquet::file::properties::WriterProperties;
use snafu::prelude::*;
use std::fs::File;
use std::path::Path;
use std::time::Instant;

use crate::config::ParquetCompression;
use crate::emit;
use crate::error::{ParquetError, StagingFileSnafu, WriteSnafu, WriterCreateSnafu};
use crate::metrics::events::ParquetWriteCompleted;

/// Writes record batches as standalone Parquet files.
#[derive(Debug, Clone)]
pub struct ParquetFileWriter {
    schema: SchemaRef,
    compression: ParquetCompression,
}

impl ParquetFileWriter {
    pub fn new(schema: SchemaRef, compression: ParquetCompression) -> Self {
        Self {
            schema,
            compression,
        }
    }

    fn writer_properties(&self) -> WriterProperties {
        let compression = match self.compression {
            ParquetCompression::Uncompressed => Compression::UNCOMPRESSED,
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Gzip => Compression::GZIP(GzipLevel::default()),
            ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
            ParquetCompression::Lz4 => Compression::LZ4,
        };
        WriterProperties::builder()
            .set_compression(compression)
            .build()
    }

    /// Write `batch` to a new file at `path` and return its size in bytes.
    pub fn write_file(&self, path: &Path, batch: &RecordBatch) -> Result<u64, ParquetError> {
        let start = Instant::now();
        let display = path.display().to_string();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(StagingFileSnafu {
                path: display.as_str(),
            })?;
        }
        let file = File::create(path).context(StagingFileSnafu {
            path: display.as_str(),
        })?;
        let mut writer =
            ArrowWriter::try_new(file, self.schema.clone(), Some(self.writer_properties()))
                .context(WriterCreateSnafu)?;
        writer.write(batch).context(WriteSnafu)?;
        writer.close().context(WriteSnafu)?;

        let size = std::fs::metadata(path)
            .context(StagingFileSnafu { path: display })?
            .len();

        emit!(ParquetWriteCompleted {
            duration: start.elapsed()
        });
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{price_schema, records_to_batch};
    use crate::transform::{Observation, PriceRecord};
    use chrono::Utc;
    use deltalake::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::TempDir;

    fn records(n: usize) -> Vec<PriceRecord> {
        let now = Utc::now();
        (0..n)
            .map(|i| {
                PriceRecord::new(
                    format!("ID{i}"),
                    "US",
                    "Electronics",
                    Observation {
                        retail_price: Some(10.0 + i as f64),
                        discounted_price: None,
                        rating: Some(4.5),
                    },
                    now,
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_written_file_reads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segment.parquet");
        let writer = ParquetFileWriter::new(price_schema(), ParquetCompression::Snappy);

        let batch = records_to_batch(&records(25)).unwrap();
        let size = writer.write_file(&path, &batch).unwrap();
        assert_eq!(size, std::fs::metadata(&path).unwrap().len());

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let rows: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(rows, 25);
    }

    #[test]
    fn test_every_codec_writes() {
        let dir = TempDir::new().unwrap();
        let batch = records_to_batch(&records(3)).unwrap();

        for (i, codec) in [
            ParquetCompression::Uncompressed,
            ParquetCompression::Snappy,
            ParquetCompression::Gzip,
            ParquetCompression::Zstd,
            ParquetCompression::Lz4,
        ]
        .into_iter()
        .enumerate()
        {
            let path = dir.path().join(format!("{i}.parquet"));
            let size = ParquetFileWriter::new(price_schema(), codec)
                .write_file(&path, &batch)
                .unwrap();
            assert!(size > 0);
        }
    }

    #[test]
    fn test_missing_directory_is_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("segment.parquet");
        let batch = records_to_batch(&records(1)).unwrap();

        ParquetFileWriter::new(price_schema(), ParquetCompression::Snappy)
            .write_file(&path, &batch)
            .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_unwritable_location_is_staging_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let path = blocker.join("segment.parquet");
        let batch = records_to_batch(&records(1)).unwrap();

        let err = ParquetFileWriter::new(price_schema(), ParquetCompression::Snappy)
            .write_file(&path, &batch)
            .unwrap_err();
        assert!(matches!(err, ParquetError::StagingFile { .. }));
    }
}
