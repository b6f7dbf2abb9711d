//! Grafana HTTP API client. Loki is reached through Grafana's datasource proxy.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{LokiMcpError, Result};
use crate::model::Direction;

/// Where proxied Loki requests are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LokiDatasource {
    Id(i64),
    Uid(String),
}

impl LokiDatasource {
    fn proxy_path(&self) -> String {
        match self {
            LokiDatasource::Id(id) => format!("/api/datasources/proxy/{id}"),
            LokiDatasource::Uid(uid) => {
                format!("/api/datasources/proxy/uid/{}", urlencoding::encode(uid))
            }
        }
    }
}

pub struct GrafanaClient {
    base_url: String,
    http: reqwest::Client,
    loki: OnceCell<LokiDatasource>,
}

impl GrafanaClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let mut bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| LokiMcpError::ConfigError(format!("invalid API key: {e}")))?;
        bearer.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| LokiMcpError::ConfigError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            loki: OnceCell::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /api/datasources`, wrapped as `{"datasources": [...]}`.
    pub async fn get_datasources(&self) -> Result<Value> {
        let url = format!("{}/api/datasources", self.base_url);
        let list = self.get_json("Error getting datasources", &url, &[]).await?;
        Ok(serde_json::json!({ "datasources": list }))
    }

    pub async fn get_datasource_by_id(&self, id: i64) -> Result<Value> {
        let url = format!("{}/api/datasources/{id}", self.base_url);
        self.get_json("Error getting datasource by ID", &url, &[]).await
    }

    pub async fn get_datasource_by_name(&self, name: &str) -> Result<Value> {
        let url = format!(
            "{}/api/datasources/name/{}",
            self.base_url,
            urlencoding::encode(name)
        );
        self.get_json("Error getting datasource by name", &url, &[]).await
    }

    /// Resolves the first Loki datasource once and reuses it afterwards.
    pub async fn loki_datasource(&self) -> Result<&LokiDatasource> {
        self.loki
            .get_or_try_init(|| async {
                let datasources = self.get_datasources().await?;
                let found = pick_loki_datasource(&datasources).ok_or(LokiMcpError::NoLokiDatasource)?;
                debug!(datasource = ?found, "resolved Loki datasource");
                Ok::<_, LokiMcpError>(found)
            })
            .await
    }

    pub async fn query_range(
        &self,
        query: &str,
        start_ns: i64,
        end_ns: i64,
        limit: u32,
        direction: Direction,
    ) -> Result<Value> {
        let url = self.loki_url("/loki/api/v1/query_range").await?;
        let params = [
            ("query", query.to_string()),
            ("start", start_ns.to_string()),
            ("end", end_ns.to_string()),
            ("limit", limit.to_string()),
            ("direction", direction.as_str().to_string()),
        ];
        self.get_json("Error querying Loki", &url, &params).await
    }

    pub async fn labels(&self) -> Result<Value> {
        let url = self.loki_url("/loki/api/v1/labels").await?;
        self.get_json("Error getting Loki labels", &url, &[]).await
    }

    pub async fn label_values(&self, label: &str) -> Result<Value> {
        let path = format!("/loki/api/v1/label/{}/values", urlencoding::encode(label));
        let url = self.loki_url(&path).await?;
        self.get_json("Error getting Loki label values", &url, &[]).await
    }

    async fn loki_url(&self, path: &str) -> Result<String> {
        let ds = self.loki_datasource().await?;
        Ok(format!("{}{}{}", self.base_url, ds.proxy_path(), path))
    }

    async fn get_json(&self, operation: &str, url: &str, query: &[(&str, String)]) -> Result<Value> {
        debug!(url, "GET");
        let resp = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| LokiMcpError::request(operation, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let base = format!("HTTP {status} for url ({url})");
            let detail = match resp.text().await {
                Ok(body) => enrich_detail(base, &body),
                Err(e) => {
                    debug!(url, "failed to read error body: {e}");
                    format!("{base} - Response unreadable: {e}")
                }
            };
            return Err(LokiMcpError::request(operation, detail));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| LokiMcpError::request(operation, format!("invalid JSON response: {e}")))
    }
}

/// 第一个 type 为 loki 的数据源；优先数字 id，其次 uid
fn pick_loki_datasource(datasources: &Value) -> Option<LokiDatasource> {
    datasources
        .get("datasources")?
        .as_array()?
        .iter()
        .filter(|ds| ds.get("type").and_then(Value::as_str) == Some("loki"))
        .find_map(|ds| {
            ds.get("id")
                .and_then(Value::as_i64)
                .map(LokiDatasource::Id)
                .or_else(|| {
                    ds.get("uid")
                        .and_then(Value::as_str)
                        .map(|uid| LokiDatasource::Uid(uid.to_string()))
                })
        })
}

/// Appends the response body to an error message: JSON bodies as
/// ` - Details: ...`, non-empty text as ` - Response: ...`.
pub fn enrich_detail(base: String, body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        return format!("{base} - Details: {json}");
    }
    if body.trim().is_empty() {
        base
    } else {
        format!("{base} - Response: {body}")
    }
}
