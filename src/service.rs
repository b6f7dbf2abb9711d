use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::GrafanaConfig;
use crate::error::Result;
use crate::grafana::GrafanaClient;
use crate::model::{QueryLokiParams, TimeRange};
use crate::time::{self, nanos_to_rfc3339, Clock, Normalized, SystemClock, TimeKind, NANOS_PER_SEC};

pub const QUERY_LOKI_DESCRIPTION: &str = r#"Query Loki logs through Grafana.

Args:
    query: Loki query string (LogQL), Loki's domain-specific language for filtering and extracting logs.
        Note: Separate multiple labels with commas. E.g.: `{app="frontend", source="user"}`
        Examples:
        - Simple log stream selection: `{app="frontend"}`
        - Multiple labels: `{app="frontend", source="user"}`
        - Filtering logs with pattern: `{app="frontend"} |= "error"`
        - Multiple filters: `{app="frontend"} |= "error" != "timeout"`
        - Regular expression: `{app="frontend"} |~ "error.*timeout"`
        - Extracting fields: `{app="frontend"} | json`
        - Extracting specific fields: `{app="frontend"} | json message, level`
        - Filtering on extracted fields: `{app="frontend"} | json | level="error"`
        - Counting logs: `count_over_time({app="frontend"}[5m])`
        - Rate of logs: `rate({app="frontend"}[5m])`
    start: Start time, accepts Grafana relative time (e.g. 'now-1h', units s/m/h/d/w), ISO8601/RFC3339, or Unix seconds. Default: 1 hour ago.
    end: End time, same formats as start. Default: now.
    limit: Maximum number of log lines to return. Default: 100.
    direction: Query direction, either 'forward' or 'backward'. Default: backward.
    max_per_line: Maximum characters per log line (0 for unlimited). Default: 100.

Unrecognized start/end values are replaced by the current time and listed under `warnings` in the result.

References:
    - Introduction to LogQL: https://grafana.com/docs/loki/latest/logql/
    - LogQL filter expressions: https://grafana.com/docs/loki/latest/logql/filter-expr/"#;

const LISTED_LABELS: usize = 20;
const DEFAULT_LOOKBACK_NANOS: i64 = 3_600 * NANOS_PER_SEC;

/// Loki 查询服务：负责参数默认值、时间归一化、结果裁剪，HTTP 细节交给 GrafanaClient。
pub struct LokiService {
    client: GrafanaClient,
    clock: Arc<dyn Clock>,
    description: OnceCell<String>,
}

impl LokiService {
    pub fn new(client: GrafanaClient) -> Self {
        Self::with_clock(client, Arc::new(SystemClock))
    }

    pub fn with_clock(client: GrafanaClient, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            clock,
            description: OnceCell::new(),
        }
    }

    pub fn from_config(cfg: &GrafanaConfig) -> Result<Self> {
        let client = GrafanaClient::new(&cfg.url, &cfg.api_key, Duration::from_secs(cfg.timeout_secs))?;
        info!(grafana = client.base_url(), "Grafana client ready");
        Ok(Self::new(client))
    }

    /// Resolves optional bounds against a single evaluation instant.
    ///
    /// Missing or empty bounds default to the last hour ending now; a lone
    /// `end` gets a start one hour before it.
    pub fn resolve_range(&self, start: Option<&str>, end: Option<&str>) -> TimeRange {
        let now = self.clock.now_nanos();
        let start = start.filter(|s| !s.trim().is_empty());
        let end = end.filter(|s| !s.trim().is_empty());

        let end = match end {
            Some(expr) => time::normalize(expr, now),
            None => time::normalize("now", now),
        };
        let start = match start {
            Some(expr) => time::normalize(expr, now),
            None => Normalized {
                nanos: end.nanos.saturating_sub(DEFAULT_LOOKBACK_NANOS),
                kind: TimeKind::Relative,
            },
        };
        TimeRange { start, end }
    }

    pub async fn query_loki(&self, params: QueryLokiParams) -> Result<Value> {
        let range = self.resolve_range(params.start.as_deref(), params.end.as_deref());

        let mut warnings = Vec::new();
        for (name, expr, bound) in [
            ("start", params.start.as_deref(), range.start),
            ("end", params.end.as_deref(), range.end),
        ] {
            if bound.is_fallback() {
                warnings.push(format!(
                    "{name} time {:?} was not recognized; using current time {}",
                    expr.unwrap_or_default(),
                    nanos_to_rfc3339(bound.nanos)
                ));
            }
        }
        if range.start.nanos > range.end.nanos {
            warn!(start = range.start.nanos, end = range.end.nanos, "query range start is after end");
        }
        debug!(
            query = %params.query,
            start = %nanos_to_rfc3339(range.start.nanos),
            end = %nanos_to_rfc3339(range.end.nanos),
            "querying Loki"
        );

        let mut data = self
            .client
            .query_range(
                &params.query,
                range.start.nanos,
                range.end.nanos,
                params.limit,
                params.direction,
            )
            .await?;

        truncate_log_lines(&mut data, params.max_per_line);
        if !warnings.is_empty() {
            if let Some(obj) = data.as_object_mut() {
                obj.insert("warnings".into(), Value::from(warnings));
            }
        }
        Ok(data)
    }

    pub async fn get_loki_labels(&self) -> Result<Value> {
        self.client.labels().await
    }

    pub async fn get_loki_label_values(&self, label: &str) -> Result<Value> {
        self.client.label_values(label).await
    }

    pub async fn get_datasources(&self) -> Result<Value> {
        self.client.get_datasources().await
    }

    pub async fn get_datasource_by_id(&self, id: i64) -> Result<Value> {
        self.client.get_datasource_by_id(id).await
    }

    pub async fn get_datasource_by_name(&self, name: &str) -> Result<Value> {
        self.client.get_datasource_by_name(name).await
    }

    /// `query_loki` description, extended once with the labels Loki knows about.
    /// Falls back to the static text if labels cannot be fetched.
    pub async fn query_loki_description(&self) -> String {
        self.description
            .get_or_init(|| async {
                match self.client.labels().await {
                    Ok(labels) => describe_with_labels(&labels),
                    Err(e) => {
                        debug!("label lookup for tool description failed: {e}");
                        QUERY_LOKI_DESCRIPTION.to_string()
                    }
                }
            })
            .await
            .clone()
    }
}

fn describe_with_labels(labels: &Value) -> String {
    let names: Vec<&str> = labels
        .get("data")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if names.is_empty() {
        return QUERY_LOKI_DESCRIPTION.to_string();
    }

    let mut listed = names
        .iter()
        .take(LISTED_LABELS)
        .map(|l| format!("`{l}`"))
        .collect::<Vec<_>>()
        .join(", ");
    if names.len() > LISTED_LABELS {
        listed.push_str(&format!(", ... and {} more", names.len() - LISTED_LABELS));
    }
    format!("{QUERY_LOKI_DESCRIPTION}\n\nAvailable labels: {listed}")
}

/// Cuts every log line in `data.result[*].values[*][1]` to `max_chars`
/// characters plus `...`. Zero disables truncation. Metric results are left alone.
pub fn truncate_log_lines(data: &mut Value, max_chars: usize) {
    if max_chars == 0 {
        return;
    }
    let result_type = data.pointer("/data/resultType").and_then(Value::as_str);
    if result_type.is_some_and(|t| t != "streams") {
        return;
    }
    let Some(streams) = data
        .pointer_mut("/data/result")
        .and_then(Value::as_array_mut)
    else {
        return;
    };

    for stream in streams {
        let Some(values) = stream.get_mut("values").and_then(Value::as_array_mut) else {
            continue;
        };
        for entry in values {
            let Some(line) = entry.get_mut(1) else { continue };
            let Some(text) = line.as_str() else { continue };
            if let Some((cut, _)) = text.char_indices().nth(max_chars) {
                let truncated = format!("{}...", &text[..cut]);
                *line = Value::String(truncated);
            }
        }
    }
}
