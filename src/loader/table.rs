//! Delta Lake table management.

use deltalake::DeltaTable;
use deltalake::arrow::datatypes::Schema;
use deltalake::operations::create::CreateBuilder;
use object_store::path::Path;
use tracing::info;
use url::Url;

use crate::error::DeltaError;
use crate::storage::StorageProvider;

/// Table property restricting file statistics to the lookup columns.
pub const DATA_SKIPPING_COLUMNS_PROPERTY: &str = "delta.dataSkippingStatsColumns";

/// Ensure Delta Lake cloud storage handlers are registered.
///
/// Registering more than once is harmless.
pub fn ensure_handlers_registered() {
    deltalake::aws::register_handlers(None);
    deltalake::gcp::register_handlers(None);
}

/// Convert an Arrow schema to a Delta schema.
pub fn arrow_schema_to_delta(schema: &Schema) -> Result<deltalake::kernel::StructType, DeltaError> {
    use deltalake::kernel::engine::arrow_conversion::TryIntoKernel;
    use deltalake::kernel::{DataType as DeltaType, StructField, StructType};

    let fields: Vec<StructField> = schema
        .fields()
        .iter()
        .map(|field| {
            let delta_type: DeltaType = field
                .data_type()
                .try_into_kernel()
                .map_err(|source| DeltaError::SchemaConversion { source })?;
            Ok(StructField::new(
                field.name(),
                delta_type,
                field.is_nullable(),
            ))
        })
        .collect::<Result<Vec<_>, DeltaError>>()?;

    StructType::try_new(fields).map_err(|e| DeltaError::StructType {
        message: e.to_string(),
    })
}

/// Table root URL for a storage provider.
pub fn table_url(storage: &StorageProvider) -> Result<Url, DeltaError> {
    let url = storage.url_for(&Path::from(""));
    Url::parse(&url).map_err(|_| DeltaError::UrlParse { url })
}

/// Open the table, creating it with `schema` when it does not exist yet.
pub async fn load_or_create_table(
    storage: &StorageProvider,
    schema: &Schema,
    table_name: &str,
    stats_columns: &[String],
) -> Result<DeltaTable, DeltaError> {
    let url = table_url(storage)?;

    match deltalake::open_table_with_storage_options(url.clone(), storage.storage_options().clone())
        .await
    {
        Ok(table) => {
            info!(
                table = table_name,
                "Loaded existing Delta table at version {}",
                table.version().unwrap_or(-1)
            );
            Ok(table)
        }
        Err(_) => {
            info!(table = table_name, "Creating new Delta table at {}", url);
            let delta_schema = arrow_schema_to_delta(schema)?;

            let mut builder = CreateBuilder::new()
                .with_location(url.as_str())
                .with_table_name(table_name)
                .with_columns(delta_schema.fields().cloned())
                .with_storage_options(storage.storage_options().clone());

            if !stats_columns.is_empty() {
                builder = builder.with_configuration([(
                    DATA_SKIPPING_COLUMNS_PROPERTY,
                    Some(stats_columns.join(",")),
                )]);
            }

            builder
                .await
                .map_err(|source| DeltaError::DeltaOperation { source })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::price_schema;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_price_schema_converts() {
        let delta = arrow_schema_to_delta(&price_schema()).unwrap();
        assert_eq!(delta.fields().count(), 9);
    }

    #[tokio::test]
    async fn test_table_is_created_once() {
        ensure_handlers_registered();
        let dir = TempDir::new().unwrap();
        let storage =
            StorageProvider::for_url_with_options(dir.path().to_str().unwrap(), HashMap::new())
                .await
                .unwrap();
        let stats = vec!["identifier".to_string(), "marketplace".to_string()];

        let table = load_or_create_table(&storage, &price_schema(), "prices", &stats)
            .await
            .unwrap();
        assert_eq!(table.version(), Some(0));

        let table = load_or_create_table(&storage, &price_schema(), "prices", &stats)
            .await
            .unwrap();
        assert_eq!(table.version(), Some(0));
        assert!(dir.path().join("_delta_log").exists());
    }
}
