//! Prometheus access for kubelet volume statistics
//!
//! A [`PrometheusClient`] issues instant queries against one endpoint. The
//! [`PrometheusClientRegistry`] hands out one client per distinct URL and is
//! shared by every concurrent reconciliation, so autoscalers pointing at the
//! same Prometheus reuse one connection pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Default per-request timeout for Prometheus queries
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from a telemetry query
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("invalid query response: {0}")]
    Decode(String),

    #[error("no samples for {query}")]
    NoData { query: String },

    #[error("query rejected ({error_type}): {error}")]
    Query { error_type: String, error: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },
}

/// Source of numeric telemetry for a volume
///
/// Implemented by [`PrometheusClientRegistry`]; mocked in controller tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Evaluate `expr` against the Prometheus at `prometheus_url` and return
    /// the first sample's value.
    async fn query(&self, prometheus_url: &str, expr: &str) -> Result<f64, MetricsError>;
}

/// Kubelet volume-stats query expressions for one PVC
pub mod queries {
    fn selector(metric: &str, namespace: &str, pvc: &str) -> String {
        format!("{metric}{{namespace=\"{namespace}\",persistentvolumeclaim=\"{pvc}\"}}")
    }

    /// Bytes used on the volume
    pub fn used_bytes(namespace: &str, pvc: &str) -> String {
        selector("kubelet_volume_stats_used_bytes", namespace, pvc)
    }

    /// Filesystem capacity of the volume
    pub fn capacity_bytes(namespace: &str, pvc: &str) -> String {
        selector("kubelet_volume_stats_capacity_bytes", namespace, pvc)
    }

    /// 1 when the kubelet reports the volume abnormal
    pub fn health_abnormal(namespace: &str, pvc: &str) -> String {
        selector("kubelet_volume_stats_health_abnormal", namespace, pvc)
    }

    /// Total inodes on the volume
    pub fn inodes(namespace: &str, pvc: &str) -> String {
        selector("kubelet_volume_stats_inodes", namespace, pvc)
    }

    /// Inodes in use on the volume
    pub fn inodes_used(namespace: &str, pvc: &str) -> String {
        selector("kubelet_volume_stats_inodes_used", namespace, pvc)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    value: (f64, String),
}

/// Decode an instant-query response body into a single value
fn decode_instant(body: &[u8], expr: &str) -> Result<f64, MetricsError> {
    let response: QueryResponse =
        serde_json::from_slice(body).map_err(|e| MetricsError::Decode(e.to_string()))?;

    if response.status != "success" {
        return Err(MetricsError::Query {
            error_type: response.error_type.unwrap_or_else(|| "unknown".to_string()),
            error: response.error.unwrap_or_default(),
        });
    }

    let data = response
        .data
        .ok_or_else(|| MetricsError::Decode("missing data".to_string()))?;

    let raw = match data.result_type.as_str() {
        "vector" => {
            let samples: Vec<VectorSample> = serde_json::from_value(data.result)
                .map_err(|e| MetricsError::Decode(e.to_string()))?;
            match samples.into_iter().next() {
                Some(sample) => sample.value.1,
                None => {
                    return Err(MetricsError::NoData {
                        query: expr.to_string(),
                    })
                }
            }
        }
        "scalar" => {
            let (_, value): (f64, String) = serde_json::from_value(data.result)
                .map_err(|e| MetricsError::Decode(e.to_string()))?;
            value
        }
        other => {
            return Err(MetricsError::Decode(format!(
                "unsupported result type {other}"
            )))
        }
    };

    let value: f64 = raw
        .parse()
        .map_err(|_| MetricsError::Decode(format!("sample value {raw:?} is not a number")))?;
    if !value.is_finite() {
        return Err(MetricsError::Decode(format!("sample value {raw} is not finite")));
    }
    Ok(value)
}

/// Client for a single Prometheus endpoint
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    base_url: String,
    http: reqwest::Client,
}

impl PrometheusClient {
    /// Create a client for `base_url` reusing `http`'s connection pool
    pub fn with_client(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: normalize_url(base_url),
            http,
        }
    }

    /// Endpoint this client queries
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run an instant query and return the first sample
    pub async fn query(&self, expr: &str) -> Result<f64, MetricsError> {
        let url = format!("{}/api/v1/query", self.base_url);
        debug!(url = %url, query = %expr, "Querying Prometheus");

        let response = self
            .http
            .get(&url)
            .query(&[("query", expr)])
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;

        let status = response.status();
        // Prometheus answers bad queries with 400/422 and a JSON error body
        if !status.is_success() && status.as_u16() != 400 && status.as_u16() != 422 {
            return Err(MetricsError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| request_error(&url, e))?;
        decode_instant(&body, expr)
    }
}

fn request_error(url: &str, e: reqwest::Error) -> MetricsError {
    if e.is_timeout() {
        MetricsError::Timeout {
            url: url.to_string(),
        }
    } else {
        MetricsError::Http {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Process-wide cache of Prometheus clients keyed by endpoint URL
///
/// Safe for concurrent use: lookups take a read lock, and a miss re-checks
/// under the write lock so two callers racing on a new URL share one client.
#[derive(Debug)]
pub struct PrometheusClientRegistry {
    clients: RwLock<HashMap<String, Arc<PrometheusClient>>>,
    http: reqwest::Client,
}

impl PrometheusClientRegistry {
    /// Create a registry whose clients time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, MetricsError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MetricsError::Http {
                url: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self::with_client(http))
    }

    /// Create a registry sharing a preconfigured HTTP client
    pub fn with_client(http: reqwest::Client) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            http,
        }
    }

    /// Get or create the client for `url`
    pub fn client_for(&self, url: &str) -> Arc<PrometheusClient> {
        let key = normalize_url(url);

        if let Some(client) = self.clients.read().get(&key) {
            return Arc::clone(client);
        }

        let mut clients = self.clients.write();
        Arc::clone(clients.entry(key).or_insert_with_key(|key| {
            debug!(url = %key, "Creating Prometheus client");
            Arc::new(PrometheusClient::with_client(key, self.http.clone()))
        }))
    }

    /// Number of distinct endpoints seen so far
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// True if no client has been created yet
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

#[async_trait]
impl MetricsBackend for PrometheusClientRegistry {
    async fn query(&self, prometheus_url: &str, expr: &str) -> Result<f64, MetricsError> {
        self.client_for(prometheus_url).query(expr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPR: &str = "kubelet_volume_stats_used_bytes{}";

    #[test]
    fn decodes_first_vector_sample() {
        let body = br#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"persistentvolumeclaim": "data-0"}, "value": [1712000000.123, "8589934592"]},
                    {"metric": {"persistentvolumeclaim": "data-0"}, "value": [1712000000.123, "1"]}
                ]
            }
        }"#;
        assert_eq!(decode_instant(body, EXPR).unwrap(), 8589934592.0);
    }

    #[test]
    fn decodes_scalar() {
        let body = br#"{"status":"success","data":{"resultType":"scalar","result":[1712000000,"0.5"]}}"#;
        assert_eq!(decode_instant(body, EXPR).unwrap(), 0.5);
    }

    #[test]
    fn empty_vector_is_no_data() {
        let body = br#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        match decode_instant(body, EXPR) {
            Err(MetricsError::NoData { query }) => assert_eq!(query, EXPR),
            other => panic!("expected NoData, got {other:?}"),
        }
    }

    #[test]
    fn error_status_is_query_error() {
        let body = br#"{"status":"error","errorType":"bad_data","error":"parse error at char 4"}"#;
        match decode_instant(body, EXPR) {
            Err(MetricsError::Query { error_type, error }) => {
                assert_eq!(error_type, "bad_data");
                assert!(error.contains("parse error"));
            }
            other => panic!("expected Query error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage_and_non_finite_values() {
        assert!(matches!(
            decode_instant(b"<html>", EXPR),
            Err(MetricsError::Decode(_))
        ));

        let nan = br#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{},"value":[1,"NaN"]}]}}"#;
        assert!(matches!(
            decode_instant(nan, EXPR),
            Err(MetricsError::Decode(_))
        ));

        let matrix = br#"{"status":"success","data":{"resultType":"matrix","result":[]}}"#;
        assert!(matches!(
            decode_instant(matrix, EXPR),
            Err(MetricsError::Decode(_))
        ));
    }

    #[test]
    fn queries_filter_by_namespace_and_claim() {
        assert_eq!(
            queries::used_bytes("db", "data-0"),
            r#"kubelet_volume_stats_used_bytes{namespace="db",persistentvolumeclaim="data-0"}"#
        );
        assert!(queries::capacity_bytes("db", "data-0")
            .starts_with("kubelet_volume_stats_capacity_bytes{"));
        assert!(queries::health_abnormal("db", "data-0")
            .starts_with("kubelet_volume_stats_health_abnormal{"));
        assert!(queries::inodes_used("db", "data-0").starts_with("kubelet_volume_stats_inodes_used{"));
        assert!(queries::inodes("db", "data-0").starts_with("kubelet_volume_stats_inodes{"));
    }

    #[test]
    fn registry_reuses_clients_per_url() {
        let registry = PrometheusClientRegistry::new(DEFAULT_QUERY_TIMEOUT).unwrap();
        assert!(registry.is_empty());

        let a = registry.client_for("http://prometheus:9090");
        let b = registry.client_for("http://prometheus:9090/");
        let c = registry.client_for("http://thanos:9090");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.base_url(), "http://prometheus:9090");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn registry_is_safe_under_concurrent_first_use() {
        let registry = Arc::new(PrometheusClientRegistry::new(DEFAULT_QUERY_TIMEOUT).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.client_for("http://prometheus:9090"))
            })
            .collect();
        let clients: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(registry.len(), 1);
        assert!(clients.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_http_error() {
        let registry = PrometheusClientRegistry::new(Duration::from_secs(2)).unwrap();
        // port 1 on localhost refuses connections
        let result = registry.query("http://127.0.0.1:1", EXPR).await;
        assert!(matches!(
            result,
            Err(MetricsError::Http { .. } | MetricsError::Timeout { .. })
        ));
    }
}
