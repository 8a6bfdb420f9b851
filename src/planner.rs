//! Batch planning.

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::catalog::{Catalog, marketplace_of};
use crate::config::MarketplaceConfig;

/// A unit of remote work: up to `batch_size` identifiers of one
/// (marketplace, category) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Position in the fully materialised plan.
    pub index: usize,
    pub marketplace: String,
    pub category: String,
    pub identifiers: Vec<String>,
}

/// Split the catalog into ordered batches.
///
/// Domains whose marketplace is not configured are skipped with a warning.
/// `batch_size` must be positive; config validation guarantees it.
pub fn plan(
    catalog: &Catalog,
    batch_size: usize,
    marketplaces: &IndexMap<String, MarketplaceConfig>,
) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();

    for (domain_key, category, identifiers) in catalog.entries() {
        let marketplace = marketplace_of(domain_key);
        if !marketplaces.contains_key(marketplace) {
            warn!(domain = domain_key, category, "Skipping unknown marketplace");
            continue;
        }

        for chunk in identifiers.chunks(batch_size) {
            batches.push(Batch {
                index: batches.len(),
                marketplace: marketplace.to_string(),
                category: category.to_string(),
                identifiers: chunk.to_vec(),
            });
        }
    }

    debug!(batches = batches.len(), batch_size, "Planned batches");
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marketplaces() -> IndexMap<String, MarketplaceConfig> {
        IndexMap::from([
            (
                "US".to_string(),
                MarketplaceConfig {
                    domain_id: 1,
                    currency: "USD".to_string(),
                },
            ),
            (
                "DE".to_string(),
                MarketplaceConfig {
                    domain_id: 4,
                    currency: "EUR".to_string(),
                },
            ),
        ])
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("ID{i:04}")).collect()
    }

    #[test]
    fn test_batches_cover_every_identifier_in_order() {
        let catalog: Catalog = [
            ("AmazonUS".to_string(), "Electronics".to_string(), ids(7)),
            ("AmazonDE".to_string(), "Books".to_string(), ids(3)),
        ]
        .into_iter()
        .collect();

        let batches = plan(&catalog, 3, &marketplaces());
        let sizes: Vec<_> = batches.iter().map(|b| b.identifiers.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1, 3]);

        let flattened: Vec<_> = batches
            .iter()
            .filter(|b| b.marketplace == "US")
            .flat_map(|b| b.identifiers.clone())
            .collect();
        assert_eq!(flattened, ids(7));

        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.index, i);
        }
        assert_eq!(batches[3].marketplace, "DE");
        assert_eq!(batches[3].category, "Books");
    }

    #[test]
    fn test_unknown_marketplace_is_skipped() {
        let catalog: Catalog = [
            ("AmazonFR".to_string(), "Toys".to_string(), ids(4)),
            ("AmazonUS".to_string(), "Toys".to_string(), ids(2)),
        ]
        .into_iter()
        .collect();

        let batches = plan(&catalog, 50, &marketplaces());
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].index, 0);
        assert_eq!(batches[0].marketplace, "US");
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_batch() {
        let catalog: Catalog = [("AmazonUS".to_string(), "Toys".to_string(), ids(100))]
            .into_iter()
            .collect();
        let batches = plan(&catalog, 50, &marketplaces());
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.identifiers.len() == 50));
    }

    #[test]
    fn test_empty_category_yields_nothing() {
        let catalog: Catalog = [("AmazonUS".to_string(), "Toys".to_string(), Vec::new())]
            .into_iter()
            .collect();
        assert!(plan(&catalog, 50, &marketplaces()).is_empty());
    }
}
