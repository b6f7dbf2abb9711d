//! Grafana-Loki MCP 服务核心库
//! 通过 Grafana 数据源代理查询 Loki，对外暴露 MCP 工具。

pub mod config;
pub mod error;
pub mod grafana;
pub mod http;
pub mod mcp;
pub mod model;
pub mod service;
pub mod time;
