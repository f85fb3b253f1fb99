//! Analytical query execution service.
//!
//! Speaks the load/meta HTTP protocol of the upstream analytics engine:
//! `POST {base}/load` with a query envelope returns rows under `data`,
//! `GET {base}/meta` describes the available sources. Metadata changes
//! rarely, so it is cached with a TTL; health checks ride on `meta`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::QueryServiceSettings;
use crate::error::QueryServiceError;
use crate::metrics::get_metrics;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub measures: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<QueryFilter>,
    #[serde(rename = "timeDimensions", skip_serializing_if = "Vec::is_empty")]
    pub time_dimensions: Vec<TimeDimension>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryFilter {
    pub member: String,
    pub operator: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeDimension {
    pub dimension: String,
    #[serde(rename = "dateRange")]
    pub date_range: [String; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<String>,
}

#[derive(Debug, Serialize)]
struct LoadRequest<'a> {
    query: &'a QueryRequest,
}

#[derive(Debug, Deserialize)]
struct LoadResponse {
    #[serde(default)]
    data: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaResponse {
    #[serde(default)]
    pub cubes: Vec<MetaCube>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaCube {
    pub name: String,
    #[serde(default)]
    pub measures: Vec<MetaMember>,
    #[serde(default)]
    pub dimensions: Vec<MetaMember>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaMember {
    pub name: String,
}

// ============================================================================
// Service trait
// ============================================================================

#[async_trait]
pub trait QueryService: Send + Sync {
    async fn execute(&self, request: QueryRequest) -> Result<QueryResult, QueryServiceError>;

    async fn meta(&self) -> Result<Arc<MetaResponse>, QueryServiceError>;

    /// Reachability probe driven off metadata.
    async fn healthy(&self) -> bool {
        self.meta().await.is_ok()
    }
}

// ============================================================================
// HTTP implementation
// ============================================================================

pub struct HttpQueryService {
    client: Client,
    base_url: String,
    api_token: Option<String>,
    timeout_ms: u64,
    meta_cache: Cache<(), Arc<MetaResponse>>,
}

impl HttpQueryService {
    pub fn new(settings: &QueryServiceSettings) -> Result<Self, QueryServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| {
                QueryServiceError::SourceUnavailable(format!("cannot build http client: {e}"))
            })?;

        let meta_cache = Cache::builder()
            .max_capacity(1)
            .time_to_live(Duration::from_secs(settings.meta_ttl_secs))
            .build();

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_token: settings.api_token.clone(),
            timeout_ms: settings.timeout_secs * 1000,
            meta_cache,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.api_token {
            builder = builder.header("Authorization", token.clone());
        }
        builder
    }

    fn map_send_error(&self, error: reqwest::Error) -> QueryServiceError {
        if error.is_timeout() {
            QueryServiceError::ExecutionTimeout(self.timeout_ms)
        } else if error.is_connect() {
            QueryServiceError::SourceUnavailable(format!("connection failed: {error}"))
        } else {
            QueryServiceError::SourceUnavailable(format!("request failed: {error}"))
        }
    }

    async fn fetch_meta(&self) -> Result<Arc<MetaResponse>, QueryServiceError> {
        let response = self
            .request(reqwest::Method::GET, "/meta")
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueryServiceError::SourceUnavailable(format!(
                "meta returned {status}: {}",
                snippet(&body)
            )));
        }
        let meta: MetaResponse = response
            .json()
            .await
            .map_err(|e| QueryServiceError::MalformedResponse(e.to_string()))?;
        Ok(Arc::new(meta))
    }
}

#[async_trait]
impl QueryService for HttpQueryService {
    async fn execute(&self, request: QueryRequest) -> Result<QueryResult, QueryServiceError> {
        let started = Instant::now();
        let response = self
            .request(reqwest::Method::POST, "/load")
            .json(&LoadRequest { query: &request })
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "query rejected by source");
            return Err(QueryServiceError::SchemaMismatch(snippet(&body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueryServiceError::SourceUnavailable(format!(
                "load returned {status}: {}",
                snippet(&body)
            )));
        }

        let parsed: LoadResponse = response
            .json()
            .await
            .map_err(|e| QueryServiceError::MalformedResponse(e.to_string()))?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        get_metrics()
            .query_duration_seconds
            .observe(elapsed_ms as f64 / 1000.0);
        debug!(rows = parsed.data.len(), elapsed_ms, "query executed");

        Ok(QueryResult {
            rows: parsed.data,
            elapsed_ms,
        })
    }

    async fn meta(&self) -> Result<Arc<MetaResponse>, QueryServiceError> {
        if let Some(meta) = self.meta_cache.get(&()).await {
            get_metrics().cache_hits_total.inc();
            return Ok(meta);
        }
        get_metrics().cache_misses_total.inc();
        let meta = self.fetch_meta().await?;
        self.meta_cache.insert((), Arc::clone(&meta)).await;
        Ok(meta)
    }
}

/// First line of an error body, capped, for log and error messages.
fn snippet(body: &str) -> String {
    let line = body.lines().next().unwrap_or("").trim();
    let mut out: String = line.chars().take(200).collect();
    if line.chars().count() > 200 {
        out.push('…');
    }
    if out.is_empty() {
        out.push_str("(empty body)");
    }
    out
}
