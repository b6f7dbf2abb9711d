use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::error::{LokiMcpError, Result};
use crate::model::{DatasourceIdParams, DatasourceNameParams, LabelValuesParams, QueryLokiParams};
use crate::service::LokiService;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "Grafana-Loki Query Server";

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(RpcError { code, message }),
        }
    }
}

pub async fn run_stdio(service: Arc<LokiService>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    serve_lines(service, BufReader::new(stdin), stdout).await
}

/// 逐行读取 JSON-RPC 请求并逐行写回响应，通知类消息不回复
pub async fn serve_lines<R, W>(service: Arc<LokiService>, input: R, mut output: W) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!("MCP stdio transport started");
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let resp = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(req) => process_request(service.clone(), req).await,
            Err(e) => Some(RpcResponse::err(Value::Null, -32700, format!("parse error: {e}"))),
        };
        if let Some(resp) = resp {
            write_response(&mut output, &resp).await?;
        }
    }

    info!("stdin closed, MCP stdio transport stopped");
    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(output: &mut W, resp: &RpcResponse) -> Result<()> {
    let line = serde_json::to_string(resp)?;
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}

/// Handles one JSON-RPC message. Notifications (no id) produce no response.
pub async fn process_request(service: Arc<LokiService>, req: RpcRequest) -> Option<RpcResponse> {
    debug!(method = %req.method, "rpc request");
    let is_notification = req.id.is_null();

    let resp = match req.method.as_str() {
        "initialize" => RpcResponse::ok(req.id, initialize_result()),
        "ping" => RpcResponse::ok(req.id, json!({})),
        m if m.starts_with("notifications/") => return None,
        "tools/list" => {
            let tools = tool_definitions(&service.query_loki_description().await);
            RpcResponse::ok(req.id, json!({ "tools": tools }))
        }
        "tools/call" => handle_call_tool(&service, req.id, req.params).await,
        _ => RpcResponse::err(req.id, -32601, format!("method not found: {}", req.method)),
    };

    if is_notification {
        None
    } else {
        Some(resp)
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": {}
        },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

#[derive(Debug, Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Parsed tool invocation.
#[derive(Debug)]
pub enum ToolCall {
    QueryLoki(QueryLokiParams),
    GetLokiLabels,
    GetLokiLabelValues(LabelValuesParams),
    GetDatasources,
    GetDatasourceById(DatasourceIdParams),
    GetDatasourceByName(DatasourceNameParams),
}

impl ToolCall {
    pub fn parse(name: &str, arguments: Value) -> Result<Self> {
        let args = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        let call = match name {
            "query_loki" => ToolCall::QueryLoki(from_args(name, args)?),
            "get_loki_labels" => ToolCall::GetLokiLabels,
            "get_loki_label_values" => ToolCall::GetLokiLabelValues(from_args(name, args)?),
            "get_datasources" => ToolCall::GetDatasources,
            "get_datasource_by_id" => ToolCall::GetDatasourceById(from_args(name, args)?),
            "get_datasource_by_name" => ToolCall::GetDatasourceByName(from_args(name, args)?),
            other => return Err(LokiMcpError::InvalidRequest(format!("unknown tool: {other}"))),
        };
        Ok(call)
    }

    pub async fn execute(self, service: &LokiService) -> Result<Value> {
        match self {
            ToolCall::QueryLoki(p) => service.query_loki(p).await,
            ToolCall::GetLokiLabels => service.get_loki_labels().await,
            ToolCall::GetLokiLabelValues(p) => service.get_loki_label_values(&p.label).await,
            ToolCall::GetDatasources => service.get_datasources().await,
            ToolCall::GetDatasourceById(p) => service.get_datasource_by_id(p.datasource_id).await,
            ToolCall::GetDatasourceByName(p) => service.get_datasource_by_name(&p.name).await,
        }
    }
}

fn from_args<T: serde::de::DeserializeOwned>(tool: &str, args: Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| LokiMcpError::InvalidRequest(format!("invalid arguments for {tool}: {e}")))
}

async fn handle_call_tool(service: &LokiService, id: Value, params: Value) -> RpcResponse {
    let call = serde_json::from_value::<CallToolParams>(params)
        .map_err(|e| LokiMcpError::InvalidRequest(format!("invalid params: {e}")))
        .and_then(|p| ToolCall::parse(&p.name, p.arguments));
    let call = match call {
        Ok(c) => c,
        Err(e) => return RpcResponse::err(id, -32602, e.to_string()),
    };

    // 工具执行失败按 MCP 约定放进 result，并标记 isError
    match call.execute(service).await {
        Ok(value) => {
            let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
            RpcResponse::ok(id, tool_result(text, false))
        }
        Err(e) => {
            warn!("tool call failed: {e}");
            RpcResponse::ok(id, tool_result(e.to_string(), true))
        }
    }
}

fn tool_result(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error
    })
}

pub fn tool_definitions(query_loki_description: &str) -> Vec<Value> {
    vec![
        json!({
            "name": "query_loki",
            "description": query_loki_description,
            "inputSchema": {
                "type": "object",
                "required": ["query"],
                "properties": {
                    "query": { "type": "string", "description": "Loki query string (LogQL) to execute" },
                    "start": { "type": ["string", "null"], "description": "Start time (Grafana format like 'now-1h', ISO format, Unix timestamp, or RFC3339)" },
                    "end": { "type": ["string", "null"], "description": "End time (Grafana format like 'now', ISO format, Unix timestamp, or RFC3339)" },
                    "limit": { "type": "integer", "default": 100, "description": "Maximum number of log lines to return" },
                    "direction": { "type": "string", "enum": ["forward", "backward"], "default": "backward" },
                    "max_per_line": { "type": "integer", "default": 100, "description": "Maximum characters per log line (0 for unlimited)" }
                }
            }
        }),
        json!({
            "name": "get_loki_labels",
            "description": "Get all label names from Loki.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "get_loki_label_values",
            "description": "Get values for a specific label from Loki.",
            "inputSchema": {
                "type": "object",
                "required": ["label"],
                "properties": { "label": { "type": "string", "description": "Label name" } }
            }
        }),
        json!({
            "name": "get_datasources",
            "description": "Get all datasources from Grafana.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "get_datasource_by_id",
            "description": "Get a specific datasource by ID from Grafana.",
            "inputSchema": {
                "type": "object",
                "required": ["datasource_id"],
                "properties": { "datasource_id": { "type": "integer", "description": "ID of the datasource to retrieve" } }
            }
        }),
        json!({
            "name": "get_datasource_by_name",
            "description": "Get a specific datasource by name from Grafana.",
            "inputSchema": {
                "type": "object",
                "required": ["name"],
                "properties": { "name": { "type": "string", "description": "Name of the datasource to retrieve" } }
            }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grafana::GrafanaClient;
    use std::time::Duration;

    // 不会真正发出请求的服务；指向不可达地址
    fn offline_service() -> Arc<LokiService> {
        let client = GrafanaClient::new("http://127.0.0.1:9", "k", Duration::from_millis(200)).unwrap();
        Arc::new(LokiService::new(client))
    }

    fn req(id: Value, method: &str, params: Value) -> RpcRequest {
        RpcRequest {
            id,
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn tool_call_parsing() {
        match ToolCall::parse("query_loki", json!({"query": "{app=\"x\"}", "direction": "forward"})).unwrap() {
            ToolCall::QueryLoki(p) => {
                assert_eq!(p.limit, 100);
                assert_eq!(p.max_per_line, 100);
                assert_eq!(p.direction, crate::model::Direction::Forward);
                assert!(p.start.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(ToolCall::parse("get_loki_labels", Value::Null), Ok(ToolCall::GetLokiLabels)));
        assert!(ToolCall::parse("query_loki", json!({"start": "now-1h"})).is_err());
        assert!(ToolCall::parse("get_datasource_by_id", json!({"datasource_id": "seven"})).is_err());
        assert!(ToolCall::parse("drop_tables", json!({})).is_err());
    }

    #[test]
    fn six_tools_are_listed() {
        let tools = tool_definitions("desc");
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(
            names,
            [
                "query_loki",
                "get_loki_labels",
                "get_loki_label_values",
                "get_datasources",
                "get_datasource_by_id",
                "get_datasource_by_name"
            ]
        );
        assert_eq!(tools[0]["description"], "desc");
    }

    #[tokio::test]
    async fn initialize_and_ping() {
        let svc = offline_service();
        let resp = process_request(svc.clone(), req(json!(1), "initialize", Value::Null)).await.unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], SERVER_NAME);

        let resp = process_request(svc, req(json!("p"), "ping", Value::Null)).await.unwrap();
        assert_eq!(resp.id, json!("p"));
        assert_eq!(resp.result.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn notifications_get_no_reply() {
        let svc = offline_service();
        assert!(process_request(svc.clone(), req(Value::Null, "notifications/initialized", Value::Null))
            .await
            .is_none());
        assert!(process_request(svc, req(Value::Null, "ping", Value::Null)).await.is_none());
    }

    #[tokio::test]
    async fn unknown_method_and_bad_params() {
        let svc = offline_service();
        let resp = process_request(svc.clone(), req(json!(2), "resources/list", Value::Null)).await.unwrap();
        assert_eq!(resp.error.unwrap().code, -32601);

        let resp = process_request(
            svc,
            req(json!(3), "tools/call", json!({"name": "get_loki_label_values", "arguments": {}})),
        )
        .await
        .unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32602);
        assert!(err.message.contains("label"));
    }

    #[tokio::test]
    async fn unreachable_grafana_is_a_tool_error() {
        let svc = offline_service();
        let resp = process_request(
            svc,
            req(json!(4), "tools/call", json!({"name": "get_datasources"})),
        )
        .await
        .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], true);
        assert!(result["content"][0]["text"]
            .as_str()
            .unwrap()
            .starts_with("Error getting datasources"));
    }

    #[tokio::test]
    async fn stdio_loop_answers_each_line() {
        let svc = offline_service();
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#, "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#, "\n",
            "\n",
            "not json\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#, "\n",
        );
        let mut out = Vec::new();
        serve_lines(svc, BufReader::new(input.as_bytes()), &mut out).await.unwrap();

        let lines: Vec<RpcResponse> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].id, json!(1));
        assert_eq!(lines[1].error.as_ref().unwrap().code, -32700);
        assert_eq!(lines[2].id, json!(2));
    }
}
