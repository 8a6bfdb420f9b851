//! Raw API items to validated price records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use snafu::prelude::*;
use tracing::debug;

use crate::error::{
    EmptyFieldSnafu, InvalidValueSnafu, MalformedSnafu, MissingIdentifierSnafu,
    MissingStatsSnafu, TransformError,
};

/// Index of the discounted (Amazon) price in `stats.current`.
const DISCOUNTED_PRICE_INDEX: usize = 0;
/// Index of the list (new) price in `stats.current`.
const RETAIL_PRICE_INDEX: usize = 3;

#[derive(Debug, Deserialize)]
struct RawProduct {
    #[serde(default)]
    asin: Option<String>,
    #[serde(default)]
    stats: Option<RawStats>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStats {
    #[serde(default)]
    current: Vec<Option<f64>>,
    #[serde(default)]
    rating: Option<serde_json::Value>,
}

impl RawStats {
    /// Price in major units at `index`; non-positive values mean "no data".
    fn price(&self, index: usize) -> Option<f64> {
        self.current
            .get(index)
            .copied()
            .flatten()
            .filter(|cents| *cents > 0.0)
            .map(|cents| cents / 100.0)
    }

    fn latest_rating(&self) -> Option<f64> {
        self.rating
            .as_ref()
            .and_then(|r| r.as_array())
            .and_then(|ratings| ratings.last())
            .and_then(|r| r.as_f64())
    }
}

/// One output row.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceRecord {
    pub date: NaiveDate,
    pub retail_price: Option<f64>,
    pub discounted_price: Option<f64>,
    pub rating: Option<f64>,
    pub identifier: String,
    pub marketplace: String,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub ingestion_date: NaiveDate,
}

/// Measured values of a record, already converted to USD.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Observation {
    pub retail_price: Option<f64>,
    pub discounted_price: Option<f64>,
    pub rating: Option<f64>,
}

impl PriceRecord {
    /// Build a record dated by `created_at`, rejecting empty keys and
    /// unusable numbers.
    pub fn new(
        identifier: impl Into<String>,
        marketplace: impl Into<String>,
        category: impl Into<String>,
        observation: Observation,
        created_at: DateTime<Utc>,
    ) -> Result<Self, TransformError> {
        let identifier = identifier.into();
        let marketplace = marketplace.into();
        let category = category.into();

        ensure!(!identifier.is_empty(), EmptyFieldSnafu { field: "identifier" });
        ensure!(!marketplace.is_empty(), EmptyFieldSnafu { field: "marketplace" });
        ensure!(!category.is_empty(), EmptyFieldSnafu { field: "category" });

        for (field, value) in [
            ("retail_price", observation.retail_price),
            ("discounted_price", observation.discounted_price),
        ] {
            if let Some(value) = value {
                ensure!(
                    value.is_finite() && value > 0.0,
                    InvalidValueSnafu { field, value }
                );
            }
        }
        if let Some(value) = observation.rating {
            ensure!(
                value.is_finite(),
                InvalidValueSnafu {
                    field: "rating",
                    value
                }
            );
        }

        let date = created_at.date_naive();
        Ok(Self {
            date,
            retail_price: observation.retail_price,
            discounted_price: observation.discounted_price,
            rating: observation.rating,
            identifier,
            marketplace,
            category,
            created_at,
            ingestion_date: date,
        })
    }
}

/// Records produced from one batch plus the number of dropped items.
#[derive(Debug, Default)]
pub struct TransformOutput {
    pub records: Vec<PriceRecord>,
    pub skipped: usize,
}

fn product_to_record(
    item: &serde_json::Value,
    marketplace: &str,
    category: &str,
    fx_rate: f64,
    now: DateTime<Utc>,
) -> Result<PriceRecord, TransformError> {
    let product = RawProduct::deserialize(item).context(MalformedSnafu)?;
    let identifier = product
        .asin
        .filter(|asin| !asin.is_empty())
        .context(MissingIdentifierSnafu)?;
    let stats = product.stats.context(MissingStatsSnafu {
        identifier: identifier.as_str(),
    })?;

    let observation = Observation {
        retail_price: stats.price(RETAIL_PRICE_INDEX).map(|p| p * fx_rate),
        discounted_price: stats.price(DISCOUNTED_PRICE_INDEX).map(|p| p * fx_rate),
        rating: stats.latest_rating(),
    };
    PriceRecord::new(identifier, marketplace, category, observation, now)
}

/// Convert raw API items into records for one (marketplace, category) batch.
///
/// Every record of a call shares the same `created_at`. Bad items are
/// skipped one by one without affecting the rest.
pub fn transform(
    items: &[serde_json::Value],
    marketplace: &str,
    category: &str,
    fx_rate: f64,
    now: DateTime<Utc>,
) -> TransformOutput {
    let mut output = TransformOutput::default();
    for item in items {
        match product_to_record(item, marketplace, category, fx_rate, now) {
            Ok(record) => output.records.push(record),
            Err(e) => {
                debug!(marketplace, category, error = %e, "Skipping item");
                output.skipped += 1;
            }
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 6, 30, 0).unwrap()
    }

    #[test]
    fn test_retail_only_price() {
        let items = vec![json!({"asin": "A", "stats": {"current": [0, 0, 0, 1999]}})];
        let out = transform(&items, "US", "Electronics", 1.0, now());

        assert_eq!(out.skipped, 0);
        let record = &out.records[0];
        assert_eq!(record.retail_price, Some(19.99));
        assert_eq!(record.discounted_price, None);
        assert_eq!(record.rating, None);
        assert_eq!(record.identifier, "A");
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2025, 3, 14).unwrap());
        assert_eq!(record.ingestion_date, record.date);
        assert_eq!(record.created_at, now());
    }

    #[test]
    fn test_prices_are_converted_and_rating_is_last() {
        let items = vec![json!({
            "asin": "B",
            "stats": {"current": [1000, -1, 5, 2000], "rating": [40, 43, 45]}
        })];
        let out = transform(&items, "GB", "Garden", 1.25, now());

        let record = &out.records[0];
        assert_eq!(record.retail_price, Some(25.0));
        assert_eq!(record.discounted_price, Some(12.5));
        assert_eq!(record.rating, Some(45.0));
        assert_eq!(record.marketplace, "GB");
        assert_eq!(record.category, "Garden");
    }

    #[test]
    fn test_negative_and_short_current_become_none() {
        let items = vec![
            json!({"asin": "C", "stats": {"current": [-1, 0, 0, -1]}}),
            json!({"asin": "D", "stats": {"current": [500]}}),
            json!({"asin": "E", "stats": {"current": [null, null, null, null], "rating": []}}),
        ];
        let out = transform(&items, "US", "Toys", 1.0, now());

        assert_eq!(out.records.len(), 3);
        assert_eq!(out.records[0].retail_price, None);
        assert_eq!(out.records[0].discounted_price, None);
        assert_eq!(out.records[1].discounted_price, Some(5.0));
        assert_eq!(out.records[1].retail_price, None);
        assert_eq!(out.records[2].rating, None);
    }

    #[test]
    fn test_bad_items_are_skipped_individually() {
        let items = vec![
            json!({"stats": {"current": [100]}}),
            json!({"asin": "NOSTATS"}),
            json!("not an object"),
            json!({"asin": "", "stats": {}}),
            json!({"asin": "OK", "stats": {}}),
        ];
        let out = transform(&items, "US", "Toys", 1.0, now());

        assert_eq!(out.skipped, 4);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].identifier, "OK");
    }

    #[test]
    fn test_record_validation() {
        let err = PriceRecord::new("A", "", "Toys", Observation::default(), now()).unwrap_err();
        assert!(matches!(
            err,
            TransformError::EmptyField {
                field: "marketplace"
            }
        ));

        let bad_price = Observation {
            retail_price: Some(f64::NAN),
            ..Observation::default()
        };
        assert!(PriceRecord::new("A", "US", "Toys", bad_price, now()).is_err());

        let negative = Observation {
            discounted_price: Some(-3.0),
            ..Observation::default()
        };
        assert!(PriceRecord::new("A", "US", "Toys", negative, now()).is_err());
    }
}
