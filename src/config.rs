use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::error::{LokiMcpError, Result};

pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0";
pub const DEFAULT_HTTP_PORT: u16 = 52229;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Stdio,
    Sse,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrafanaConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GrafanaConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub transport: Transport,
    pub http_addr: Option<String>,
    pub http_port: Option<u16>,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!(
            "{}:{}",
            self.http_addr.as_deref().unwrap_or(DEFAULT_HTTP_ADDR),
            self.http_port.unwrap_or(DEFAULT_HTTP_PORT)
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub grafana: GrafanaConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// 按扩展名加载 YAML 或 JSON 配置文件
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            LokiMcpError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(&raw).map_err(|e| {
                LokiMcpError::ConfigError(format!("invalid JSON in {}: {e}", path.display()))
            })
        } else {
            serde_yaml::from_str(&raw).map_err(|e| {
                LokiMcpError::ConfigError(format!("invalid YAML in {}: {e}", path.display()))
            })
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.grafana.url.trim().is_empty() {
            return Err(LokiMcpError::ConfigError(
                "Grafana URL is required. Set GRAFANA_URL or use --url".into(),
            ));
        }
        if self.grafana.api_key.trim().is_empty() {
            return Err(LokiMcpError::ConfigError(
                "Grafana API key is required. Set GRAFANA_API_KEY or use --api-key".into(),
            ));
        }
        Ok(())
    }
}

/// Grafana-Loki MCP server
#[derive(Debug, Parser)]
#[command(name = "grafana-loki-mcp", version, about = "Query Loki logs through Grafana over MCP")]
pub struct Cli {
    /// Grafana URL
    #[arg(short = 'u', long = "url", env = "GRAFANA_URL")]
    pub grafana_url: Option<String>,

    /// Grafana API key
    #[arg(short = 'k', long = "api-key", env = "GRAFANA_API_KEY", hide_env_values = true)]
    pub grafana_api_key: Option<String>,

    /// Transport protocol
    #[arg(short = 't', long, value_enum)]
    pub transport: Option<Transport>,

    /// Optional YAML/JSON config file; flags and environment take precedence
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Bind address for the SSE transport
    #[arg(long)]
    pub host: Option<String>,

    /// Port for the SSE transport
    #[arg(long)]
    pub port: Option<u16>,
}

impl Cli {
    pub fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from_path(path)?,
            None => Config::default(),
        };
        if let Some(url) = self.grafana_url.filter(|u| !u.is_empty()) {
            config.grafana.url = url;
        }
        if let Some(key) = self.grafana_api_key.filter(|k| !k.is_empty()) {
            config.grafana.api_key = key;
        }
        if let Some(transport) = self.transport {
            config.server.transport = transport;
        }
        if self.host.is_some() {
            config.server.http_addr = self.host;
        }
        if self.port.is_some() {
            config.server.http_port = self.port;
        }
        Ok(config)
    }
}
