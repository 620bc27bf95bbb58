//! DuckDB-dialect compilers for builder queries.
//!
//! Every series query produces `(labels VARCHAR, bucket BIGINT, value DOUBLE)`
//! and every list query produces `(ts BIGINT, id VARCHAR, data VARCHAR)`.
//! `labels` and `data` hold `key=value` pairs separated by [`FIELD_SEPARATOR`].

pub mod expression;
pub mod logs;
pub mod metrics;
pub mod traces;

pub use expression::SqlExpressionCompiler;
pub use logs::LogsCompiler;
pub use metrics::MetricsCompiler;
pub use traces::TracesCompiler;

use crate::compile::{CompileOptions, GraphLimitPhase, QueryBuilder, LIMIT_PLACEHOLDER};
use crate::models::{
    AggregateOperator, AttributeKey, BuilderQuery, DataSource, FilterItem, FilterOperator,
    PanelType, SortOrder,
};
use crate::{QuerierError, Result};
use serde_json::Value;
use std::sync::Arc;

/// Separates `key=value` pairs in the `labels` and `data` columns.
pub const FIELD_SEPARATOR: char = '\x1f';

pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS metric_samples (
        metric_name VARCHAR NOT NULL,
        ts BIGINT NOT NULL,
        value DOUBLE NOT NULL,
        attributes MAP(VARCHAR, VARCHAR)
    );
    CREATE TABLE IF NOT EXISTS logs (
        id VARCHAR NOT NULL,
        ts BIGINT NOT NULL,
        severity_text VARCHAR,
        body VARCHAR,
        attributes MAP(VARCHAR, VARCHAR)
    );
    CREATE TABLE IF NOT EXISTS spans (
        trace_id VARCHAR NOT NULL,
        span_id VARCHAR NOT NULL,
        ts BIGINT NOT NULL,
        name VARCHAR,
        service_name VARCHAR,
        duration_nano BIGINT,
        has_error BOOLEAN,
        attributes MAP(VARCHAR, VARCHAR)
    );
";

/// A query builder with the DuckDB compilers registered for every data
/// source.
pub fn duckdb_query_builder() -> QueryBuilder {
    QueryBuilder::new()
        .with_compiler(DataSource::Metrics, Arc::new(MetricsCompiler))
        .with_compiler(DataSource::Logs, Arc::new(LogsCompiler))
        .with_compiler(DataSource::Traces, Arc::new(TracesCompiler))
        .with_expression_compiler(Arc::new(SqlExpressionCompiler))
}

pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub(crate) fn quote_ident(name: &str) -> Result<String> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(QuerierError::Compilation(format!(
            "invalid column name {:?}",
            name
        )));
    }
    Ok(format!("\"{}\"", name))
}

/// SQL expression reading `key`, either a column or an attributes map entry.
pub(crate) fn attribute_expr(key: &AttributeKey) -> Result<String> {
    if key.is_column {
        quote_ident(&key.key)
    } else {
        Ok(format!("element_at(attributes, {})[1]", quote_literal(&key.key)))
    }
}

fn value_literal(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(quote_literal(s)),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok("NULL".to_string()),
        other => Err(QuerierError::Compilation(format!(
            "unsupported filter value {}",
            other
        ))),
    }
}

fn list_literal(value: &Value) -> Result<String> {
    let items = match value {
        Value::Array(items) => items
            .iter()
            .map(value_literal)
            .collect::<Result<Vec<_>>>()?,
        scalar => vec![value_literal(scalar)?],
    };
    if items.is_empty() {
        return Err(QuerierError::Compilation(
            "empty value list in filter".to_string(),
        ));
    }
    Ok(format!("({})", items.join(", ")))
}

fn string_value(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(QuerierError::Compilation(format!(
            "expected a string filter value, got {}",
            other
        ))),
    }
}

pub(crate) fn filter_condition(item: &FilterItem) -> Result<String> {
    let expr = attribute_expr(&item.key)?;
    let condition = match item.operator {
        FilterOperator::Eq => format!("{} = {}", expr, value_literal(&item.value)?),
        FilterOperator::NotEq => format!("{} != {}", expr, value_literal(&item.value)?),
        FilterOperator::Lt => format!("{} < {}", expr, value_literal(&item.value)?),
        FilterOperator::Lte => format!("{} <= {}", expr, value_literal(&item.value)?),
        FilterOperator::Gt => format!("{} > {}", expr, value_literal(&item.value)?),
        FilterOperator::Gte => format!("{} >= {}", expr, value_literal(&item.value)?),
        FilterOperator::In => format!("{} IN {}", expr, list_literal(&item.value)?),
        FilterOperator::NotIn => format!("{} NOT IN {}", expr, list_literal(&item.value)?),
        FilterOperator::Like => format!(
            "{} LIKE {}",
            expr,
            quote_literal(&string_value(&item.value)?)
        ),
        FilterOperator::NotLike => format!(
            "{} NOT LIKE {}",
            expr,
            quote_literal(&string_value(&item.value)?)
        ),
        FilterOperator::Contains => format!(
            "contains({}, {})",
            expr,
            quote_literal(&string_value(&item.value)?)
        ),
        FilterOperator::NotContains => format!(
            "NOT contains({}, {})",
            expr,
            quote_literal(&string_value(&item.value)?)
        ),
        FilterOperator::Exists => format!("{} IS NOT NULL", expr),
        FilterOperator::NotExists => format!("{} IS NULL", expr),
    };
    Ok(condition)
}

/// Time window plus every filter item, joined with `AND`.
pub(crate) fn where_clause(
    query: &BuilderQuery,
    start: i64,
    end: i64,
    extra: Vec<String>,
) -> Result<String> {
    let mut conditions = vec![format!("ts >= {} AND ts <= {}", start, end)];
    conditions.extend(extra);
    for item in &query.filters.items {
        conditions.push(filter_condition(item)?);
    }
    Ok(conditions.join(" AND "))
}

/// `key=value` pairs joined by [`FIELD_SEPARATOR`].
pub(crate) fn encoded_pairs(pairs: &[(String, String)]) -> String {
    if pairs.is_empty() {
        return "''".to_string();
    }
    let parts: Vec<String> = pairs
        .iter()
        .map(|(name, expr)| {
            format!(
                "{} || coalesce(CAST({} AS VARCHAR), '')",
                quote_literal(&format!("{}=", name)),
                expr
            )
        })
        .collect();
    format!("concat_ws(chr(31), {})", parts.join(", "))
}

pub(crate) fn labels_expr(group_by: &[AttributeKey]) -> Result<String> {
    let pairs = group_by
        .iter()
        .map(|key| Ok((key.key.clone(), attribute_expr(key)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(encoded_pairs(&pairs))
}

/// Aggregation of `value_expr` (`None` counts rows) over one bucket of
/// `step` seconds.
pub(crate) fn aggregate_expr(
    operator: AggregateOperator,
    value_expr: Option<&str>,
    step: i64,
) -> Result<String> {
    let numeric = |expr: &str| format!("CAST({} AS DOUBLE)", expr);
    let needs_value = |name: &str| {
        value_expr.ok_or_else(|| {
            QuerierError::Compilation(format!("{} aggregation needs an attribute", name))
        })
    };
    let aggregate = match operator {
        AggregateOperator::Noop => {
            return Err(QuerierError::Compilation(
                "noop aggregation is only valid for list panels".to_string(),
            ))
        }
        AggregateOperator::Count => match value_expr {
            Some(expr) => format!("count({})", expr),
            None => "count(*)".to_string(),
        },
        AggregateOperator::CountDistinct => {
            format!("count(DISTINCT {})", needs_value("count_distinct")?)
        }
        AggregateOperator::Sum => format!("sum({})", numeric(needs_value("sum")?)),
        AggregateOperator::Avg => format!("avg({})", numeric(needs_value("avg")?)),
        AggregateOperator::Min => format!("min({})", numeric(needs_value("min")?)),
        AggregateOperator::Max => format!("max({})", numeric(needs_value("max")?)),
        AggregateOperator::Rate => match value_expr {
            Some(expr) => format!("sum({}) / {}", numeric(expr), step.max(1)),
            None => format!("count(*) / {}", step.max(1)),
        },
        AggregateOperator::P50 => format!("quantile_cont({}, 0.5)", numeric(needs_value("p50")?)),
        AggregateOperator::P90 => format!("quantile_cont({}, 0.9)", numeric(needs_value("p90")?)),
        AggregateOperator::P99 => format!("quantile_cont({}, 0.99)", numeric(needs_value("p99")?)),
    };
    Ok(numeric(&aggregate))
}

/// Parts every data source fills in to get a series query.
pub(crate) struct SeriesQuery<'a> {
    pub table: &'a str,
    pub query: &'a BuilderQuery,
    pub value_expr: Option<String>,
    pub conditions: Vec<String>,
}

impl SeriesQuery<'_> {
    pub fn compile(
        self,
        start: i64,
        end: i64,
        panel_type: PanelType,
        options: &CompileOptions,
    ) -> Result<String> {
        let query = self.query;
        let step = query.step_interval.max(1);
        let labels = labels_expr(&query.group_by)?;
        let value = aggregate_expr(query.aggregate_operator, self.value_expr.as_deref(), step)?;
        let mut conditions = self.conditions;

        match options.graph_limit {
            Some(GraphLimitPhase::GroupSelection) => {
                let filter = where_clause(query, start, end, conditions)?;
                return Ok(format!(
                    "SELECT {labels} FROM {table} WHERE {filter} GROUP BY 1 ORDER BY {value} DESC LIMIT {limit}",
                    labels = labels,
                    table = self.table,
                    filter = filter,
                    value = value,
                    limit = query.limit,
                ));
            }
            Some(GraphLimitPhase::Values) => {
                conditions.push(format!("{} IN ({})", labels, LIMIT_PLACEHOLDER));
            }
            None => {}
        }

        let filter = where_clause(query, start, end, conditions)?;
        let sql = match panel_type {
            PanelType::Graph => format!(
                "SELECT {labels} AS labels, ts - (ts % {step_ms}) AS bucket, {value} AS value \
                 FROM {table} WHERE {filter} GROUP BY 1, 2 ORDER BY 1, 2",
                labels = labels,
                step_ms = step * 1000,
                value = value,
                table = self.table,
                filter = filter,
            ),
            PanelType::Table | PanelType::Value => {
                let mut sql = format!(
                    "SELECT {labels} AS labels, CAST({start} AS BIGINT) AS bucket, {value} AS value \
                     FROM {table} WHERE {filter} GROUP BY 1 ORDER BY 3 DESC",
                    labels = labels,
                    start = start,
                    value = value,
                    table = self.table,
                    filter = filter,
                );
                if query.limit > 0 {
                    sql.push_str(&format!(" LIMIT {}", query.limit));
                }
                sql
            }
            PanelType::List | PanelType::Trace => {
                return Err(QuerierError::Compilation(format!(
                    "{} series cannot be shown on a list panel",
                    query.data_source.as_str()
                )))
            }
        };
        Ok(sql)
    }
}

/// Parts every data source fills in to get a list query.
pub(crate) struct ListQuery<'a> {
    pub table: &'a str,
    pub query: &'a BuilderQuery,
    pub id_column: &'a str,
    /// Columns included in `data` when the query selects none.
    pub default_columns: &'a [&'a str],
    pub limit: u64,
}

impl ListQuery<'_> {
    pub fn compile(self, start: i64, end: i64) -> Result<String> {
        let query = self.query;
        let pairs = if query.select_columns.is_empty() {
            self.default_columns
                .iter()
                .map(|c| Ok((c.to_string(), quote_ident(c)?)))
                .collect::<Result<Vec<_>>>()?
        } else {
            query
                .select_columns
                .iter()
                .map(|key| Ok((key.key.clone(), attribute_expr(key)?)))
                .collect::<Result<Vec<_>>>()?
        };

        let direction_of = |order: SortOrder| match order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let mut order = Vec::new();
        for order_by in &query.order_by {
            let direction = direction_of(order_by.order);
            let column = if order_by.column_name == "timestamp" {
                "ts".to_string()
            } else {
                quote_ident(&order_by.column_name)?
            };
            order.push(format!("{} {}", column, direction));
        }
        if order.is_empty() {
            order.push("ts DESC".to_string());
        }
        // Ties break on the id in the leading direction so an id cursor
        // resumes exactly where the previous window stopped.
        let tie_break = query
            .order_by
            .first()
            .map(|o| direction_of(o.order))
            .unwrap_or("DESC");
        order.push(format!("{} {}", self.id_column, tie_break));

        let mut sql = format!(
            "SELECT ts, CAST({id} AS VARCHAR) AS id, {data} AS data FROM {table} WHERE {filter} ORDER BY {order}",
            id = self.id_column,
            data = encoded_pairs(&pairs),
            table = self.table,
            filter = where_clause(query, start, end, Vec::new())?,
            order = order.join(", "),
        );
        if self.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", self.limit));
        }
        if query.offset > 0 {
            sql.push_str(&format!(" OFFSET {}", query.offset));
        }
        Ok(sql)
    }
}

/// Split an encoded `labels`/`data` column back into pairs.
pub fn decode_pairs(encoded: &str) -> Vec<(String, String)> {
    encoded
        .split(FIELD_SEPARATOR)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (part.to_string(), String::new()),
        })
        .collect()
}
