use crate::{QuerierError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single sample of a series, timestamp in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub timestamp: i64,
    pub value: f64,
}

impl Point {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub points: Vec<Point>,
}

impl Series {
    pub fn new(labels: BTreeMap<String, String>, points: Vec<Point>) -> Self {
        Self { labels, points }
    }

    pub fn sort_points(&mut self) {
        self.points.sort_by_key(|p| p.timestamp);
    }

    /// Collapse points sharing a timestamp, keeping the last one written.
    /// Points must already be sorted.
    pub fn remove_duplicate_points(&mut self) {
        let mut deduped: Vec<Point> = Vec::with_capacity(self.points.len());
        for point in self.points.drain(..) {
            match deduped.last_mut() {
                Some(last) if last.timestamp == point.timestamp => *last = point,
                _ => deduped.push(point),
            }
        }
        self.points = deduped;
    }
}

/// A row of a list (logs/traces) query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub timestamp: i64,
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
}

impl Row {
    pub fn id(&self) -> Option<&str> {
        self.data.get("id").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Metrics,
    Logs,
    Traces,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Metrics => "metrics",
            DataSource::Logs => "logs",
            DataSource::Traces => "traces",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelType {
    #[default]
    Graph,
    Table,
    Value,
    List,
    Trace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    #[default]
    Builder,
    #[serde(rename = "promql")]
    PromQl,
    Sql,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOperator {
    #[default]
    Noop,
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
    Rate,
    P50,
    P90,
    P99,
}

impl AggregateOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateOperator::Noop => "noop",
            AggregateOperator::Count => "count",
            AggregateOperator::CountDistinct => "count_distinct",
            AggregateOperator::Sum => "sum",
            AggregateOperator::Avg => "avg",
            AggregateOperator::Min => "min",
            AggregateOperator::Max => "max",
            AggregateOperator::Rate => "rate",
            AggregateOperator::P50 => "p50",
            AggregateOperator::P90 => "p90",
            AggregateOperator::P99 => "p99",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeKey {
    pub key: String,
    /// Materialized column rather than an entry of the attributes map.
    #[serde(default)]
    pub is_column: bool,
}

impl AttributeKey {
    pub fn attribute(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            is_column: false,
        }
    }

    pub fn column(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            is_column: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    In,
    NotIn,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    Like,
    NotLike,
    Contains,
    NotContains,
    Exists,
    NotExists,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterItem {
    pub key: AttributeKey,
    #[serde(rename = "op")]
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Conjunction of filter items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSet {
    #[serde(default)]
    pub items: Vec<FilterItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBy {
    pub column_name: String,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderQuery {
    pub query_name: String,
    pub data_source: DataSource,
    #[serde(default)]
    pub aggregate_operator: AggregateOperator,
    /// Metric name for metrics, aggregated attribute for logs and traces.
    #[serde(default)]
    pub aggregate_attribute: AttributeKey,
    #[serde(default)]
    pub filters: FilterSet,
    #[serde(default)]
    pub group_by: Vec<AttributeKey>,
    /// Equal to `query_name` for plain queries, a formula otherwise.
    pub expression: String,
    #[serde(default)]
    pub disabled: bool,
    /// Aggregation step in seconds.
    #[serde(default = "default_step_interval")]
    pub step_interval: i64,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub page_size: u64,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub select_columns: Vec<AttributeKey>,
    /// Shift in seconds; the query reads `[start - shift, end - shift]`.
    #[serde(default)]
    pub shift_by: i64,
}

fn default_step_interval() -> i64 {
    60
}

impl BuilderQuery {
    pub fn new(name: impl Into<String>, data_source: DataSource) -> Self {
        let name = name.into();
        Self {
            expression: name.clone(),
            query_name: name,
            data_source,
            aggregate_operator: AggregateOperator::default(),
            aggregate_attribute: AttributeKey::default(),
            filters: FilterSet::default(),
            group_by: Vec::new(),
            disabled: false,
            step_interval: default_step_interval(),
            limit: 0,
            offset: 0,
            page_size: 0,
            order_by: Vec::new(),
            select_columns: Vec::new(),
            shift_by: 0,
        }
    }

    /// True when this entry is a formula over other queries.
    pub fn is_expression(&self) -> bool {
        self.query_name != self.expression
    }

    /// Direction of the leading `timestamp` ordering, if the query is
    /// primarily ordered by time.
    pub fn timestamp_order(&self) -> Option<SortOrder> {
        self.order_by
            .first()
            .filter(|o| o.column_name == "timestamp")
            .map(|o| o.order)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromQuery {
    pub query: String,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlQuery {
    pub query: String,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeQuery {
    #[serde(default)]
    pub query_type: QueryType,
    #[serde(default)]
    pub panel_type: PanelType,
    #[serde(default)]
    pub builder_queries: BTreeMap<String, BuilderQuery>,
    #[serde(default)]
    pub prom_queries: BTreeMap<String, PromQuery>,
    #[serde(default)]
    pub sql_queries: BTreeMap<String, SqlQuery>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRangeParams {
    /// Window start in milliseconds.
    pub start: i64,
    /// Window end in milliseconds.
    pub end: i64,
    /// Step in seconds, used by PromQL and formulas.
    #[serde(default = "default_step_interval")]
    pub step: i64,
    pub composite_query: CompositeQuery,
    #[serde(default)]
    pub no_cache: bool,
}

impl QueryRangeParams {
    /// Reject windows and intervals that cannot be turned into
    /// millisecond bounds.
    pub fn validate(&self) -> Result<()> {
        if self.start > self.end {
            return Err(QuerierError::Validation(format!(
                "start ({}) must not be after end ({})",
                self.start, self.end
            )));
        }
        if self.step <= 0 || self.step.checked_mul(1000).is_none() {
            return Err(QuerierError::Validation(format!(
                "step must be a positive number of seconds, got {}",
                self.step
            )));
        }

        for (name, query) in &self.composite_query.builder_queries {
            if query.step_interval.checked_mul(1000).is_none() {
                return Err(QuerierError::Validation(format!(
                    "step interval of {} is out of range: {}",
                    name, query.step_interval
                )));
            }
            let shifted = query
                .shift_by
                .checked_mul(1000)
                .and_then(|ms| Some((self.start.checked_sub(ms)?, self.end.checked_sub(ms)?)));
            if shifted.is_none() {
                return Err(QuerierError::Validation(format!(
                    "time shift of {} is out of range: {}",
                    name, query.shift_by
                )));
            }
        }
        Ok(())
    }
}

/// Result of one named query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub query_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub series: Vec<Series>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list: Vec<Row>,
}
