//! Columnar output for price records.
//!
//! - `parquet`: encodes record batches into local Parquet files
//! - `segment`: the bounded-memory writer that rotates and uploads segments

pub mod parquet;
pub mod segment;

use chrono::{DateTime, NaiveDate, Utc};
use deltalake::arrow::array::{
    ArrayRef, Date32Array, Float64Array, RecordBatch, StringArray, TimestampMicrosecondArray,
};
use deltalake::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use snafu::prelude::*;
use std::sync::{Arc, LazyLock};

use crate::error::{ParquetError, RecordBatchSnafu};
use crate::transform::PriceRecord;

pub use segment::{SegmentWriter, UploadedSegment};

/// Timezone attached to `created_at`.
pub const TIMESTAMP_TZ: &str = "UTC";

static PRICE_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| {
    let timestamp = DataType::Timestamp(TimeUnit::Microsecond, Some(TIMESTAMP_TZ.into()));
    Arc::new(Schema::new(vec![
        Field::new("date", DataType::Date32, false),
        Field::new("retail_price", DataType::Float64, true),
        Field::new("discounted_price", DataType::Float64, true),
        Field::new("rating", DataType::Float64, true),
        Field::new("identifier", DataType::Utf8, false),
        Field::new("marketplace", DataType::Utf8, false),
        Field::new("category", DataType::Utf8, false),
        Field::new("created_at", timestamp, false),
        Field::new("ingestion_date", DataType::Date32, false),
    ]))
});

/// Arrow schema shared by segments and the warehouse table.
pub fn price_schema() -> SchemaRef {
    Arc::clone(&PRICE_SCHEMA)
}

/// Days since the Unix epoch, as stored in `Date32`.
fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = DateTime::<Utc>::UNIX_EPOCH.date_naive();
    (date - epoch).num_days() as i32
}

/// Build one record batch from `records` in order.
pub fn records_to_batch(records: &[PriceRecord]) -> Result<RecordBatch, ParquetError> {
    let dates = Date32Array::from_iter_values(records.iter().map(|r| days_since_epoch(r.date)));
    let retail = Float64Array::from_iter(records.iter().map(|r| r.retail_price));
    let discounted = Float64Array::from_iter(records.iter().map(|r| r.discounted_price));
    let rating = Float64Array::from_iter(records.iter().map(|r| r.rating));
    let identifiers = StringArray::from_iter_values(records.iter().map(|r| r.identifier.as_str()));
    let marketplaces =
        StringArray::from_iter_values(records.iter().map(|r| r.marketplace.as_str()));
    let categories = StringArray::from_iter_values(records.iter().map(|r| r.category.as_str()));
    let created_at =
        TimestampMicrosecondArray::from_iter_values(records.iter().map(|r| r.created_at.timestamp_micros()))
            .with_timezone(TIMESTAMP_TZ);
    let ingestion =
        Date32Array::from_iter_values(records.iter().map(|r| days_since_epoch(r.ingestion_date)));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(dates),
        Arc::new(retail),
        Arc::new(discounted),
        Arc::new(rating),
        Arc::new(identifiers),
        Arc::new(marketplaces),
        Arc::new(categories),
        Arc::new(created_at),
        Arc::new(ingestion),
    ];
    RecordBatch::try_new(price_schema(), columns).context(RecordBatchSnafu)
}
