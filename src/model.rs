use serde::{Deserialize, Serialize};

use crate::time::Normalized;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    #[default]
    Backward,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

/// `query_loki` 工具参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLokiParams {
    pub query: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub direction: Direction,
    /// 0 表示不截断
    #[serde(default = "default_max_per_line")]
    pub max_per_line: usize,
}

impl QueryLokiParams {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            start: None,
            end: None,
            limit: default_limit(),
            direction: Direction::default(),
            max_per_line: default_max_per_line(),
        }
    }
}

fn default_limit() -> u32 {
    100
}

fn default_max_per_line() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelValuesParams {
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasourceIdParams {
    pub datasource_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasourceNameParams {
    pub name: String,
}

/// Both bounds of a `query_range` call, resolved against one evaluation instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Normalized,
    pub end: Normalized,
}
