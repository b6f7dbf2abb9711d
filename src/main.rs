use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use grafana_loki_mcp::config::{Cli, Transport};
use grafana_loki_mcp::http::serve_http;
use grafana_loki_mcp::mcp::run_stdio;
use grafana_loki_mcp::service::LokiService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env 需在解析参数前加载，clap 才能读到其中的变量
    let _ = dotenvy::dotenv();

    // stdout 留给 stdio 协议，日志统一写 stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.into_config().context("failed to load configuration")?;
    config.validate()?;

    let service = Arc::new(LokiService::from_config(&config.grafana)?);

    match config.server.transport {
        Transport::Stdio => run_stdio(service).await?,
        Transport::Sse => {
            info!(addr = %config.server.bind_addr(), "starting SSE transport");
            serve_http(service, &config.server).await?
        }
    }

    Ok(())
}
