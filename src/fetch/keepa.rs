//! HTTP client for the Keepa product API.

use async_trait::async_trait;
use serde::Deserialize;
use snafu::prelude::*;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{FetchOutcome, PriceSource, RetryPolicy, fetch_with_retry};
use crate::config::ApiConfig;
use crate::emit;
use crate::error::{
    ApiSnafu, ClientBuildSnafu, DecodeSnafu, FetchError, HttpSnafu, MissingApiKeySnafu,
    StatusSnafu,
};
use crate::metrics::events::{ApiRequest, RequestStatus};
use crate::planner::Batch;

#[derive(Debug, Deserialize)]
struct ProductResponse {
    #[serde(default)]
    products: Vec<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Human readable message from an API `error` field.
fn error_message(error: &serde_json::Value) -> String {
    error
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

/// Keepa product API client.
#[derive(Debug, Clone)]
pub struct KeepaClient {
    http: reqwest::Client,
    base_url: String,
    key: Option<String>,
    wait_secs: u64,
    policy: RetryPolicy,
}

impl KeepaClient {
    pub fn new(config: &ApiConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context(ClientBuildSnafu)?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            key: config.resolved_key(),
            wait_secs: config.request_wait_secs,
            policy: RetryPolicy::from_config(config),
        })
    }

    fn key(&self) -> Result<&str, FetchError> {
        self.key.as_deref().context(MissingApiKeySnafu)
    }

    /// One product request, without retries.
    async fn request_products(
        &self,
        identifiers: &[String],
        domain_id: u8,
    ) -> Result<Vec<serde_json::Value>, FetchError> {
        let key = self.key()?;
        let start = Instant::now();
        let result = self.send_product_request(key, identifiers, domain_id).await;

        emit!(ApiRequest {
            status: if result.is_ok() {
                RequestStatus::Success
            } else {
                RequestStatus::Error
            },
            duration: start.elapsed(),
        });
        result
    }

    async fn send_product_request(
        &self,
        key: &str,
        identifiers: &[String],
        domain_id: u8,
    ) -> Result<Vec<serde_json::Value>, FetchError> {
        let asins = identifiers.join(",");
        let domain = domain_id.to_string();
        let wait = self.wait_secs.to_string();

        let response = self
            .http
            .get(format!("{}/product", self.base_url))
            .query(&[
                ("key", key),
                ("domain", domain.as_str()),
                ("asin", asins.as_str()),
                ("history", "0"),
                ("stats", "1"),
                ("rating", "1"),
                ("wait", wait.as_str()),
            ])
            .send()
            .await
            .context(HttpSnafu)?;

        let status = response.status();
        ensure!(
            status.is_success(),
            StatusSnafu {
                status: status.as_u16()
            }
        );

        let body: ProductResponse = response.json().await.context(DecodeSnafu)?;
        if let Some(error) = body.error {
            return ApiSnafu {
                message: error_message(&error),
            }
            .fail();
        }
        Ok(body.products)
    }

    async fn request_token_status(&self, key: &str) -> Result<serde_json::Value, FetchError> {
        let response = self
            .http
            .get(format!("{}/token", self.base_url))
            .query(&[("key", key)])
            .send()
            .await
            .context(HttpSnafu)?;

        let status = response.status();
        ensure!(
            status.is_success(),
            StatusSnafu {
                status: status.as_u16()
            }
        );
        response.json().await.context(DecodeSnafu)
    }
}

#[async_trait]
impl PriceSource for KeepaClient {
    async fn validate(&self) -> Result<(), FetchError> {
        self.key().map(|_| ())
    }

    async fn prime(&self) {
        let Ok(key) = self.key() else {
            return;
        };

        match self.request_token_status(key).await {
            Ok(body) => {
                let tokens_left = body.get("tokensLeft").and_then(|t| t.as_i64());
                info!(tokens_left, "Primed API token bucket");
            }
            Err(e) => warn!(error = %e, "API token refresh failed, continuing"),
        }
    }

    async fn fetch(&self, batch: &Batch, domain_id: u8) -> FetchOutcome {
        debug!(
            batch = batch.index,
            domain_id,
            identifiers = batch.identifiers.len(),
            "Fetching batch"
        );
        fetch_with_retry(&self.policy, batch.index, || {
            self.request_products(&batch.identifiers, domain_id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct MockApi {
        calls: Arc<AtomicU32>,
        failures_before_success: u32,
        always_error: bool,
        seen: Arc<std::sync::Mutex<Vec<HashMap<String, String>>>>,
    }

    async fn product(
        State(api): State<MockApi>,
        Query(params): Query<HashMap<String, String>>,
    ) -> impl IntoResponse {
        let n = api.calls.fetch_add(1, Ordering::SeqCst);
        api.seen.lock().unwrap().push(params.clone());

        if api.always_error {
            return (
                StatusCode::OK,
                Json(serde_json::json!({"error": {"message": "Invalid key"}})),
            );
        }
        if n < api.failures_before_success {
            return (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({})));
        }

        let products: Vec<_> = params
            .get("asin")
            .map(|a| a.split(',').map(|asin| serde_json::json!({"asin": asin})).collect())
            .unwrap_or_default();
        (StatusCode::OK, Json(serde_json::json!({"products": products})))
    }

    async fn token() -> Json<serde_json::Value> {
        Json(serde_json::json!({"tokensLeft": 120}))
    }

    async fn serve(api: MockApi) -> String {
        let app = Router::new()
            .route("/product", get(product))
            .route("/token", get(token))
            .with_state(api);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn config(base_url: String, key: Option<&str>) -> ApiConfig {
        ApiConfig {
            key: key.map(str::to_string),
            base_url,
            initial_backoff_ms: 1,
            max_jitter_ms: 0,
            ..ApiConfig::default()
        }
    }

    fn batch(ids: &[&str]) -> Batch {
        Batch {
            index: 0,
            marketplace: "US".to_string(),
            category: "Electronics".to_string(),
            identifiers: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_fetch_sends_expected_query() {
        let api = MockApi::default();
        let base = serve(api.clone()).await;
        let client = KeepaClient::new(&config(base, Some("secret"))).unwrap();

        let outcome = client.fetch(&batch(&["A", "B"]), 3).await;
        match outcome {
            FetchOutcome::Fetched(items) => assert_eq!(items.len(), 2),
            other => panic!("unexpected {other:?}"),
        }

        let seen = api.seen.lock().unwrap();
        let params = &seen[0];
        assert_eq!(params["key"], "secret");
        assert_eq!(params["domain"], "3");
        assert_eq!(params["asin"], "A,B");
        assert_eq!(params["history"], "0");
        assert_eq!(params["stats"], "1");
        assert_eq!(params["rating"], "1");
        assert_eq!(params["wait"], "60");
    }

    #[tokio::test]
    async fn test_fetch_retries_server_errors() {
        let api = MockApi {
            failures_before_success: 2,
            ..MockApi::default()
        };
        let base = serve(api.clone()).await;
        let client = KeepaClient::new(&config(base, Some("secret"))).unwrap();

        let outcome = client.fetch(&batch(&["A"]), 1).await;
        assert!(!outcome.is_failed());
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_error_payload_fails_after_all_attempts() {
        let api = MockApi {
            always_error: true,
            ..MockApi::default()
        };
        let base = serve(api.clone()).await;
        let client = KeepaClient::new(&config(base, Some("secret"))).unwrap();

        match client.fetch(&batch(&["A"]), 1).await {
            FetchOutcome::Failed { attempts, reason } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("Invalid key"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validate_rejects_placeholder_key() {
        let placeholder = Some(crate::config::API_KEY_PLACEHOLDER);
        let client =
            KeepaClient::new(&config("http://127.0.0.1:9".to_string(), placeholder)).unwrap();
        assert!(matches!(
            client.validate().await,
            Err(FetchError::MissingApiKey)
        ));

        let client =
            KeepaClient::new(&config("http://127.0.0.1:9".to_string(), Some("k"))).unwrap();
        assert!(client.validate().await.is_ok());
    }

    #[tokio::test]
    async fn test_prime_tolerates_unreachable_api() {
        let client =
            KeepaClient::new(&config("http://127.0.0.1:9".to_string(), Some("k"))).unwrap();
        client.prime().await;

        let base = serve(MockApi::default()).await;
        let client = KeepaClient::new(&config(base, Some("k"))).unwrap();
        client.prime().await;
    }
}
