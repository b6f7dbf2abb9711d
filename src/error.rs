use thiserror::Error;

pub type Result<T> = std::result::Result<T, LokiMcpError>;

#[derive(Debug, Error)]
pub enum LokiMcpError {
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// Grafana 请求失败，detail 已附带响应体
    #[error("{operation}: {detail}")]
    GrafanaRequest { operation: String, detail: String },

    #[error("No Loki datasource found")]
    NoLokiDatasource,

    #[error("无效请求: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LokiMcpError {
    pub fn request(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::GrafanaRequest {
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}
