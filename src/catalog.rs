//! Identifier catalog.
//!
//! The catalog maps a domain key (`AmazonUS`) to categories and their
//! identifiers. Insertion order is preserved so that batch indices derived
//! from the same document are stable between runs.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use snafu::prelude::*;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::{CatalogConfig, CatalogFormat};
use crate::error::{CatalogDecodeSnafu, CatalogError, CatalogReadSnafu, CatalogStorageSnafu};
use crate::storage::{StorageProvider, split_object_url};

/// Prefix of every domain key in the catalog.
pub const DOMAIN_KEY_PREFIX: &str = "Amazon";

/// Marketplace code for a domain key: `AmazonUS` becomes `US`.
///
/// Keys without the prefix are taken verbatim.
pub fn marketplace_of(domain_key: &str) -> &str {
    domain_key
        .strip_prefix(DOMAIN_KEY_PREFIX)
        .unwrap_or(domain_key)
}

/// Ordered `domain key -> category -> identifiers` mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    domains: IndexMap<String, IndexMap<String, Vec<String>>>,
}

/// One row of a grouped catalog export.
#[derive(Debug, Deserialize)]
struct GroupedRow {
    domain: String,
    category: String,
    #[serde(default)]
    asins: Vec<String>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append identifiers to a (domain, category) pair.
    pub fn extend(
        &mut self,
        domain_key: impl Into<String>,
        category: impl Into<String>,
        identifiers: impl IntoIterator<Item = String>,
    ) {
        self.domains
            .entry(domain_key.into())
            .or_default()
            .entry(category.into())
            .or_default()
            .extend(identifiers);
    }

    /// Decode a nested `{domain: {category: [ids]}}` document.
    pub fn from_nested_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Decode an array of `{"domain", "category", "asins"}` rows.
    ///
    /// Rows sharing a (domain, category) pair are concatenated in row order.
    pub fn from_grouped_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let rows: Vec<GroupedRow> = serde_json::from_slice(bytes)?;
        let mut catalog = Self::new();
        for row in rows {
            catalog.extend(row.domain, row.category, row.asins);
        }
        Ok(catalog)
    }

    /// Iterate `(domain key, category, identifiers)` in document order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &[String])> {
        self.domains.iter().flat_map(|(domain, categories)| {
            categories
                .iter()
                .map(move |(category, ids)| (domain.as_str(), category.as_str(), ids.as_slice()))
        })
    }

    pub fn domain_keys(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }

    /// Total number of identifiers across all domains.
    pub fn identifier_count(&self) -> usize {
        self.entries().map(|(_, _, ids)| ids.len()).sum()
    }
}

impl FromIterator<(String, String, Vec<String>)> for Catalog {
    fn from_iter<I: IntoIterator<Item = (String, String, Vec<String>)>>(iter: I) -> Self {
        let mut catalog = Catalog::new();
        for (domain, category, ids) in iter {
            catalog.extend(domain, category, ids);
        }
        catalog
    }
}

/// Anything that can produce the catalog for a run.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn load(&self) -> Result<Catalog, CatalogError>;
}

#[async_trait]
impl CatalogSource for Catalog {
    async fn load(&self) -> Result<Catalog, CatalogError> {
        Ok(self.clone())
    }
}

/// Catalog document stored on the local filesystem or in object storage.
#[derive(Debug, Clone)]
pub struct StoredCatalog {
    path: String,
    format: CatalogFormat,
    storage_options: HashMap<String, String>,
}

impl StoredCatalog {
    pub fn new(config: &CatalogConfig) -> Self {
        Self {
            path: config.path.clone(),
            format: config.format,
            storage_options: config.storage_options.clone(),
        }
    }
}

#[async_trait]
impl CatalogSource for StoredCatalog {
    async fn load(&self) -> Result<Catalog, CatalogError> {
        let path = self.path.as_str();
        let (parent, name) = split_object_url(path).context(CatalogStorageSnafu { path })?;
        let storage = StorageProvider::for_url_with_options(&parent, self.storage_options.clone())
            .await
            .context(CatalogStorageSnafu { path })?;

        let bytes = storage
            .get(name.as_str())
            .await
            .context(CatalogReadSnafu { path })?;
        debug!(path, bytes = bytes.len(), "Read catalog document");

        let catalog = match self.format {
            CatalogFormat::Nested => Catalog::from_nested_json(&bytes),
            CatalogFormat::Grouped => Catalog::from_grouped_json(&bytes),
        }
        .context(CatalogDecodeSnafu { path })?;

        info!(
            path,
            domains = catalog.domain_keys().count(),
            identifiers = catalog.identifier_count(),
            "Loaded catalog"
        );
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marketplace_of_strips_prefix() {
        assert_eq!(marketplace_of("AmazonUS"), "US");
        assert_eq!(marketplace_of("AmazonJP"), "JP");
        assert_eq!(marketplace_of("DE"), "DE");
    }

    #[test]
    fn test_nested_catalog_keeps_document_order() {
        let json = br#"{
            "AmazonUS": {"Toys": ["T1"], "Electronics": ["E1", "E2"]},
            "AmazonDE": {"Books": ["B1"]}
        }"#;
        let catalog = Catalog::from_nested_json(json).unwrap();

        let entries: Vec<_> = catalog
            .entries()
            .map(|(d, c, ids)| (d.to_string(), c.to_string(), ids.len()))
            .collect();
        assert_eq!(
            entries,
            vec![
                ("AmazonUS".to_string(), "Toys".to_string(), 1),
                ("AmazonUS".to_string(), "Electronics".to_string(), 2),
                ("AmazonDE".to_string(), "Books".to_string(), 1),
            ]
        );
        assert_eq!(catalog.identifier_count(), 4);
    }

    #[test]
    fn test_grouped_rows_are_merged() {
        let json = br#"[
            {"domain": "AmazonUS", "category": "Electronics", "asins": ["A", "B"]},
            {"domain": "AmazonGB", "category": "Garden", "asins": ["G"]},
            {"domain": "AmazonUS", "category": "Electronics", "asins": ["C"]}
        ]"#;
        let catalog = Catalog::from_grouped_json(json).unwrap();

        let (domain, category, ids) = catalog.entries().next().unwrap();
        assert_eq!((domain, category), ("AmazonUS", "Electronics"));
        assert_eq!(ids, ["A", "B", "C"]);
        assert_eq!(catalog.domain_keys().collect::<Vec<_>>(), ["AmazonUS", "AmazonGB"]);
    }

    #[test]
    fn test_nested_rejects_wrong_shape() {
        assert!(Catalog::from_nested_json(br#"["A", "B"]"#).is_err());
    }

    #[tokio::test]
    async fn test_stored_catalog_reads_local_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, r#"{"AmazonUS": {"Electronics": ["A", "B", "C"]}}"#).unwrap();

        let source = StoredCatalog::new(&CatalogConfig {
            path: path.to_string_lossy().to_string(),
            format: CatalogFormat::Nested,
            storage_options: HashMap::new(),
        });
        let catalog = source.load().await.unwrap();
        assert_eq!(catalog.identifier_count(), 3);
    }

    #[tokio::test]
    async fn test_stored_catalog_missing_file_is_read_error() {
        let dir = TempDir::new().unwrap();
        let source = StoredCatalog::new(&CatalogConfig {
            path: dir.path().join("absent.json").to_string_lossy().to_string(),
            format: CatalogFormat::Nested,
            storage_options: HashMap::new(),
        });

        let err = source.load().await.unwrap_err();
        assert!(matches!(err, CatalogError::CatalogRead { .. }), "{err}");
    }
}
