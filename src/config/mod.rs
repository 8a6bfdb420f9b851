//! Configuration parsing and validation.
//!
//! Configuration is a YAML file with environment variable interpolation
//! applied before parsing. Everything except the catalog path and the
//! staging and warehouse URLs has a default.

mod vars;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{
    ConfigError, EmptyCatalogPathSnafu, EmptyStagingUrlSnafu, EmptyWarehouseUrlSnafu,
    EnvInterpolationSnafu, MissingFallbackRateSnafu, ReadFileSnafu,
    UnsupportedWarehouseBackendSnafu, YamlParseSnafu, ZeroSettingSnafu,
};
use crate::storage::BackendConfig;

/// Environment variable consulted when `api.key` is not configured.
pub const API_KEY_ENV: &str = "KEEPA_API_KEY";

/// Placeholder value shipped in sample configs; treated as unset.
pub const API_KEY_PLACEHOLDER: &str = "your-keepa-api-key";

/// Main configuration structure for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Remote price API settings.
    #[serde(default)]
    pub api: ApiConfig,
    pub catalog: CatalogConfig,
    pub staging: StagingConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub fx: FxConfig,
    /// Marketplace code to API domain and currency.
    #[serde(default = "default_marketplaces")]
    pub marketplaces: IndexMap<String, MarketplaceConfig>,
    #[serde(default)]
    pub service: ServiceConfig,
    /// Metrics configuration (optional, enabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Remote price API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API key. Falls back to `KEEPA_API_KEY` when absent.
    #[serde(default)]
    pub key: Option<String>,

    #[serde(default = "default_api_base_url")]
    pub base_url: String,

    /// Attempts per batch, including the first one (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff delay in milliseconds (default: 1000).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound of the random jitter added to each backoff (default: 1000).
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,

    /// Seconds the API may block to throttle us instead of rejecting (default: 60).
    #[serde(default = "default_request_wait_secs")]
    pub request_wait_secs: u64,

    /// Per-request timeout in seconds (default: 120).
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            key: None,
            base_url: default_api_base_url(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            request_wait_secs: default_request_wait_secs(),
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ApiConfig {
    /// The effective API key, ignoring empty and placeholder values.
    pub fn resolved_key(&self) -> Option<String> {
        self.key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty() && key != API_KEY_PLACEHOLDER)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_api_base_url() -> String {
    "https://api.keepa.com".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_jitter_ms() -> u64 {
    1000
}

fn default_request_wait_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    120
}

/// Where the identifier catalog comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Local path or object URL of the catalog document.
    pub path: String,

    #[serde(default)]
    pub format: CatalogFormat,

    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

/// Shape of the catalog document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CatalogFormat {
    /// `{domain: {category: [identifiers]}}`
    #[default]
    Nested,
    /// `[{"domain", "category", "asins": [...]}]` as exported from a grouped query.
    Grouped,
}

/// Object storage used for segments and the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Examples: "gs://my-project-keepa-staging", "/var/lib/pricestream/staging"
    pub url: String,

    /// Path prefix for uploaded segments (default: "price_data").
    #[serde(default = "default_staging_prefix")]
    pub prefix: String,

    /// Local directory for temporary segment files (default: system temp dir).
    #[serde(default)]
    pub local_dir: Option<PathBuf>,

    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,

    /// Parquet compression codec.
    #[serde(default)]
    pub compression: ParquetCompression,
}

impl StagingConfig {
    pub fn local_dir(&self) -> PathBuf {
        self.local_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

fn default_staging_prefix() -> String {
    "price_data".to_string()
}

/// Checkpoint location inside the staging storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_path")]
    pub path: String,

    /// Segments uploaded by the unfinished run, kept next to the checkpoint.
    #[serde(default = "default_manifest_path")]
    pub manifest_path: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
            manifest_path: default_manifest_path(),
        }
    }
}

fn default_checkpoint_path() -> String {
    "daily_pipeline/state.json".to_string()
}

fn default_manifest_path() -> String {
    "daily_pipeline/segments.json".to_string()
}

/// Destination Delta Lake table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// Examples: "gs://analytics/keepa_prices", "/var/lib/pricestream/table"
    pub url: String,

    /// Name used in logs and metrics (default: "keepa_prices").
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,

    /// Segment copies in flight during a load (default: 4).
    #[serde(default = "default_max_concurrent_copies")]
    pub max_concurrent_copies: usize,
}

fn default_table_name() -> String {
    "keepa_prices".to_string()
}

fn default_max_concurrent_copies() -> usize {
    4
}

/// Batching and segment sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Identifiers per API request (default: 50).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Rows per uploaded segment (default: 5000).
    #[serde(default = "default_flush_rows")]
    pub flush_rows: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_rows: default_flush_rows(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}

fn default_flush_rows() -> usize {
    5000
}

/// Currency rate source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FxConfig {
    #[serde(default = "default_fx_url")]
    pub url: String,

    #[serde(default = "default_fx_timeout_secs")]
    pub timeout_secs: u64,

    /// Multipliers to USD used when the live source is unavailable.
    #[serde(default = "default_fallback_rates")]
    pub fallback: IndexMap<String, f64>,
}

impl Default for FxConfig {
    fn default() -> Self {
        Self {
            url: default_fx_url(),
            timeout_secs: default_fx_timeout_secs(),
            fallback: default_fallback_rates(),
        }
    }
}

fn default_fx_url() -> String {
    "https://api.exchangerate-api.com/v4/latest/USD".to_string()
}

fn default_fx_timeout_secs() -> u64 {
    10
}

fn default_fallback_rates() -> IndexMap<String, f64> {
    IndexMap::from([
        ("USD".to_string(), 1.0),
        ("GBP".to_string(), 1.25),
        ("EUR".to_string(), 1.1),
        ("JPY".to_string(), 0.007),
    ])
}

/// API domain and currency for one marketplace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplaceConfig {
    pub domain_id: u8,
    pub currency: String,
}

fn default_marketplaces() -> IndexMap<String, MarketplaceConfig> {
    [("US", 1, "USD"), ("GB", 3, "GBP"), ("DE", 4, "EUR"), ("JP", 6, "JPY")]
        .into_iter()
        .map(|(code, domain_id, currency)| {
            (
                code.to_string(),
                MarketplaceConfig {
                    domain_id,
                    currency: currency.to_string(),
                },
            )
        })
        .collect()
}

/// HTTP trigger service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_address")]
    pub address: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            address: default_service_address(),
        }
    }
}

fn default_service_address() -> String {
    "0.0.0.0:8080".to_string()
}

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Address of the standalone metrics server used by `run` (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    Uncompressed,
    #[default]
    Snappy,
    Gzip,
    Zstd,
    Lz4,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_options(path, true)
    }

    /// Load configuration from a YAML file with optional environment variable interpolation.
    pub fn from_file_with_options(
        path: impl AsRef<Path>,
        interpolate_env: bool,
    ) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content, interpolate_env)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str, interpolate_env: bool) -> Result<Self, ConfigError> {
        let content = if interpolate_env {
            vars::interpolate(content).map_err(|errors| {
                EnvInterpolationSnafu {
                    message: errors.join("\n"),
                }
                .build()
            })?
        } else {
            content.to_string()
        };

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.catalog.path.trim().is_empty(), EmptyCatalogPathSnafu);
        ensure!(!self.staging.url.trim().is_empty(), EmptyStagingUrlSnafu);
        ensure!(!self.warehouse.url.trim().is_empty(), EmptyWarehouseUrlSnafu);
        // The table layer only registers the S3 and GCS log stores.
        ensure!(
            !matches!(
                BackendConfig::parse_url(&self.warehouse.url),
                Ok(BackendConfig::Azure(_))
            ),
            UnsupportedWarehouseBackendSnafu {
                url: self.warehouse.url.clone()
            }
        );
        ensure!(
            self.pipeline.batch_size > 0,
            ZeroSettingSnafu {
                field: "pipeline.batch_size"
            }
        );
        ensure!(
            self.pipeline.flush_rows > 0,
            ZeroSettingSnafu {
                field: "pipeline.flush_rows"
            }
        );
        ensure!(
            self.api.max_retries > 0,
            ZeroSettingSnafu {
                field: "api.max_retries"
            }
        );
        ensure!(
            self.warehouse.max_concurrent_copies > 0,
            ZeroSettingSnafu {
                field: "warehouse.max_concurrent_copies"
            }
        );

        for (code, marketplace) in &self.marketplaces {
            ensure!(
                self.fx.fallback.contains_key(&marketplace.currency),
                MissingFallbackRateSnafu {
                    marketplace: code.clone(),
                    currency: marketplace.currency.clone(),
                }
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
catalog:
  path: ./catalog.json

staging:
  url: /tmp/pricestream/staging

warehouse:
  url: /tmp/pricestream/table
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_yaml(MINIMAL, false).unwrap();

        assert_eq!(config.pipeline.batch_size, 50);
        assert_eq!(config.pipeline.flush_rows, 5000);
        assert_eq!(config.api.max_retries, 3);
        assert_eq!(config.api.initial_backoff(), Duration::from_secs(1));
        assert_eq!(config.api.base_url, "https://api.keepa.com");
        assert_eq!(config.checkpoint.path, "daily_pipeline/state.json");
        assert_eq!(config.checkpoint.manifest_path, "daily_pipeline/segments.json");
        assert_eq!(config.staging.prefix, "price_data");
        assert_eq!(config.catalog.format, CatalogFormat::Nested);
        assert_eq!(config.staging.compression, ParquetCompression::Snappy);
        assert_eq!(config.warehouse.table_name, "keepa_prices");

        let codes: Vec<_> = config.marketplaces.keys().cloned().collect();
        assert_eq!(codes, vec!["US", "GB", "DE", "JP"]);
        assert_eq!(config.marketplaces["JP"].domain_id, 6);
        assert_eq!(config.fx.fallback["JPY"], 0.007);
    }

    #[test]
    fn test_full_config_parsing() {
        let yaml = r#"
api:
  key: abc123
  max_retries: 5
  initial_backoff_ms: 250
catalog:
  path: gs://catalogs/asins.json
  format: grouped
staging:
  url: gs://my-project-keepa-staging
  compression: zstd
warehouse:
  url: gs://analytics/keepa_prices
  table_name: prices
pipeline:
  batch_size: 20
  flush_rows: 1000
marketplaces:
  US:
    domain_id: 1
    currency: USD
"#;
        let config = Config::from_yaml(yaml, false).unwrap();
        assert_eq!(config.api.resolved_key().as_deref(), Some("abc123"));
        assert_eq!(config.api.max_retries, 5);
        assert_eq!(config.catalog.format, CatalogFormat::Grouped);
        assert_eq!(config.staging.compression, ParquetCompression::Zstd);
        assert_eq!(config.pipeline.batch_size, 20);
        assert_eq!(config.marketplaces.len(), 1);
    }

    #[test]
    fn test_placeholder_key_is_treated_as_missing() {
        let api = ApiConfig {
            key: Some(API_KEY_PLACEHOLDER.to_string()),
            ..Default::default()
        };
        assert_eq!(api.resolved_key(), None);

        let api = ApiConfig {
            key: Some("   ".to_string()),
            ..Default::default()
        };
        assert_eq!(api.resolved_key(), None);
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let yaml = format!("{MINIMAL}\npipeline:\n  batch_size: 0\n");
        let err = Config::from_yaml(&yaml, false).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ZeroSetting {
                field: "pipeline.batch_size"
            }
        ));
    }

    #[test]
    fn test_empty_staging_url_is_rejected() {
        let yaml = r#"
catalog:
  path: ./catalog.json
staging:
  url: ""
warehouse:
  url: /tmp/table
"#;
        let err = Config::from_yaml(yaml, false).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyStagingUrl));
    }

    #[test]
    fn test_azure_warehouse_is_rejected() {
        for url in [
            "abfss://tables@analytics.dfs.core.windows.net/keepa_prices",
            "https://analytics.blob.core.windows.net/tables/keepa_prices",
        ] {
            let yaml = format!(
                "catalog:\n  path: ./catalog.json\nstaging:\n  url: /tmp/staging\nwarehouse:\n  url: {url}\n"
            );
            let err = Config::from_yaml(&yaml, false).unwrap_err();
            match err {
                ConfigError::UnsupportedWarehouseBackend { url: rejected } => {
                    assert_eq!(rejected, url)
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_azure_staging_is_accepted() {
        let yaml = r#"
catalog:
  path: ./catalog.json
staging:
  url: abfss://staging@analytics.dfs.core.windows.net/prices
warehouse:
  url: gs://analytics/keepa_prices
"#;
        let config = Config::from_yaml(yaml, false).unwrap();
        assert!(config.staging.url.starts_with("abfss://"));
    }

    #[test]
    fn test_marketplace_without_fallback_rate_is_rejected() {
        let yaml = format!(
            "{MINIMAL}\nmarketplaces:\n  CA:\n    domain_id: 6\n    currency: CAD\n"
        );
        let err = Config::from_yaml(&yaml, false).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFallbackRate { .. }));
    }

    #[test]
    fn test_interpolation_failure_is_reported() {
        let yaml = "catalog:\n  path: $PRICESTREAM_CONFIG_TEST_NEVER_SET\n";
        let err = Config::from_yaml(yaml, true).unwrap_err();
        match err {
            ConfigError::EnvInterpolation { message } => {
                assert!(message.contains("PRICESTREAM_CONFIG_TEST_NEVER_SET"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_from_file_reads_yaml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.catalog.path, "./catalog.json");
    }
}
