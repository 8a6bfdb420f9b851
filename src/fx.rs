//! Currency rates used to normalise prices to USD.
//!
//! Rates are resolved once per run. A live source failure never aborts a
//! run; the configured fallback table is used instead.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use snafu::prelude::*;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::FxConfig;
use crate::emit;
use crate::error::{ApiSnafu, ClientBuildSnafu, DecodeSnafu, FetchError, HttpSnafu, StatusSnafu};
use crate::metrics::events::{FxRatesResolved, FxSource};

/// Currency code to multiplier-to-USD.
#[derive(Debug, Clone, PartialEq)]
pub struct FxRates {
    rates: IndexMap<String, f64>,
}

impl FxRates {
    pub fn new(rates: IndexMap<String, f64>) -> Self {
        Self { rates }
    }

    pub fn get(&self, currency: &str) -> Option<f64> {
        self.rates.get(currency).copied()
    }
}

impl FromIterator<(String, f64)> for FxRates {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Source of the per-run currency table.
#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Always returns a usable table.
    async fn rates(&self) -> FxRates;
}

#[async_trait]
impl RateProvider for FxRates {
    async fn rates(&self) -> FxRates {
        self.clone()
    }
}

#[derive(Debug, Deserialize)]
struct LatestRates {
    rates: HashMap<String, f64>,
}

/// exchangerate-api.com style provider quoting currencies per USD.
#[derive(Debug, Clone)]
pub struct ExchangeRateApi {
    http: reqwest::Client,
    url: String,
    fallback: IndexMap<String, f64>,
}

impl ExchangeRateApi {
    pub fn new(config: &FxConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context(ClientBuildSnafu)?;
        Ok(Self {
            http,
            url: config.url.clone(),
            fallback: config.fallback.clone(),
        })
    }

    fn fallback(&self) -> FxRates {
        FxRates::new(self.fallback.clone())
    }

    async fn fetch_live(&self) -> Result<FxRates, FetchError> {
        let response = self.http.get(&self.url).send().await.context(HttpSnafu)?;
        let status = response.status();
        ensure!(
            status.is_success(),
            StatusSnafu {
                status: status.as_u16()
            }
        );
        let latest: LatestRates = response.json().await.context(DecodeSnafu)?;
        self.invert(&latest.rates)
    }

    /// Turn "units per USD" quotes into multipliers to USD.
    ///
    /// Currencies absent from the quote keep their fallback value.
    fn invert(&self, quotes: &HashMap<String, f64>) -> Result<FxRates, FetchError> {
        let mut rates = IndexMap::with_capacity(self.fallback.len());
        for (currency, fallback) in &self.fallback {
            let rate = if currency == "USD" {
                1.0
            } else {
                match quotes.get(currency) {
                    Some(quote) => {
                        ensure!(
                            quote.is_finite() && *quote > 0.0,
                            ApiSnafu {
                                message: format!("non-positive rate {quote} for {currency}"),
                            }
                        );
                        1.0 / quote
                    }
                    None => {
                        warn!(currency = currency.as_str(), "Rate missing from live source, using fallback");
                        *fallback
                    }
                }
            };
            rates.insert(currency.clone(), rate);
        }
        Ok(FxRates::new(rates))
    }
}

#[async_trait]
impl RateProvider for ExchangeRateApi {
    async fn rates(&self) -> FxRates {
        match self.fetch_live().await {
            Ok(rates) => {
                info!(rates = ?rates.rates, "Fetched live FX rates");
                emit!(FxRatesResolved {
                    source: FxSource::Live
                });
                rates
            }
            Err(e) => {
                warn!(error = %e, "FX rate fetch failed, using fallback rates");
                emit!(FxRatesResolved {
                    source: FxSource::Fallback
                });
                self.fallback()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    async fn serve(body: serde_json::Value) -> String {
        let app = Router::new().route(
            "/latest/USD",
            get(move || {
                let body = body.clone();
                async move { Json(body) }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/latest/USD")
    }

    fn provider(url: String) -> ExchangeRateApi {
        ExchangeRateApi::new(&FxConfig {
            url,
            timeout_secs: 2,
            ..FxConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_live_rates_are_inverted() {
        let url = serve(serde_json::json!({
            "base": "USD",
            "rates": {"USD": 1.0, "GBP": 0.8, "EUR": 0.5, "JPY": 200.0}
        }))
        .await;

        let rates = provider(url).rates().await;
        assert_eq!(rates.get("USD"), Some(1.0));
        assert_eq!(rates.get("GBP"), Some(1.25));
        assert_eq!(rates.get("EUR"), Some(2.0));
        assert_eq!(rates.get("JPY"), Some(0.005));
    }

    #[tokio::test]
    async fn test_missing_currency_uses_fallback_value() {
        let url = serve(serde_json::json!({"rates": {"GBP": 0.8, "EUR": 0.5}})).await;

        let rates = provider(url).rates().await;
        assert_eq!(rates.get("JPY"), Some(0.007));
        assert_eq!(rates.get("GBP"), Some(1.25));
    }

    #[tokio::test]
    async fn test_bad_payload_falls_back() {
        let url = serve(serde_json::json!({"result": "error"})).await;
        let rates = provider(url).rates().await;
        assert_eq!(rates, FxRates::new(FxConfig::default().fallback));
    }

    #[tokio::test]
    async fn test_zero_rate_falls_back() {
        let url = serve(serde_json::json!({"rates": {"GBP": 0.0, "EUR": 0.5, "JPY": 150.0}})).await;
        let rates = provider(url).rates().await;
        assert_eq!(rates.get("GBP"), Some(1.25));
        assert_eq!(rates.get("EUR"), Some(1.1));
    }

    #[tokio::test]
    async fn test_unreachable_source_falls_back() {
        let rates = provider("http://127.0.0.1:9/latest/USD".to_string())
            .rates()
            .await;
        assert_eq!(rates.get("USD"), Some(1.0));
        assert_eq!(rates.get("GBP"), Some(1.25));
        assert_eq!(rates.get("EUR"), Some(1.1));
        assert_eq!(rates.get("JPY"), Some(0.007));
    }
}
