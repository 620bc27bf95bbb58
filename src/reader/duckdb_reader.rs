use super::QueryExecutor;
use crate::error::{ResourceLimitError, ResourceLimitKind};
use crate::models::{Point, Row, Series};
use crate::querier::RequestContext;
use crate::sql::{decode_pairs, SCHEMA};
use crate::{QuerierError, Result};
use async_trait::async_trait;
use duckdb::{params, Connection};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// [`QueryExecutor`] over an embedded DuckDB database.
///
/// Each query runs on a blocking thread with its own cloned connection.
#[derive(Clone)]
pub struct DuckDbReader {
    conn: Arc<Mutex<Connection>>,
    query_timeout: Option<Duration>,
    /// Zero means unlimited.
    max_result_rows: usize,
}

impl DuckDbReader {
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Open (or create) the database at `path`, in memory when `None`.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_connection(Connection::open(path)?),
            None => Self::open_in_memory(),
        }
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            query_timeout: None,
            max_result_rows: 0,
        })
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    pub fn with_max_result_rows(mut self, max_rows: usize) -> Self {
        self.max_result_rows = max_rows;
        self
    }

    /// Run statements that return nothing, e.g. inserts.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection, usize) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.lock().try_clone()?;
        let max_rows = self.max_result_rows;
        let task = tokio::task::spawn_blocking(move || f(&conn, max_rows));

        let joined = match self.query_timeout {
            Some(timeout) => tokio::time::timeout(timeout, task).await.map_err(|_| {
                ResourceLimitError::new(
                    ResourceLimitKind::Time,
                    format!("query ran longer than {}ms", timeout.as_millis()),
                )
            })?,
            None => task.await,
        };
        joined.map_err(|e| QuerierError::Internal(format!("query task failed: {}", e)))?
    }
}

fn check_row_limit(rows: usize, max_rows: usize) -> Result<()> {
    if max_rows > 0 && rows > max_rows {
        return Err(ResourceLimitError::new(
            ResourceLimitKind::Rows,
            format!("query returned more than {} rows", max_rows),
        )
        .into());
    }
    Ok(())
}

fn read_series(conn: &Connection, sql: &str, max_rows: usize) -> Result<Vec<Series>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params![])?;

    let mut by_labels: BTreeMap<String, Vec<Point>> = BTreeMap::new();
    let mut count = 0;
    while let Some(row) = rows.next()? {
        count += 1;
        check_row_limit(count, max_rows)?;

        let labels: Option<String> = row.get(0)?;
        let bucket: i64 = row.get(1)?;
        let value: Option<f64> = row.get(2)?;
        if let Some(value) = value {
            by_labels
                .entry(labels.unwrap_or_default())
                .or_default()
                .push(Point::new(bucket, value));
        }
    }

    Ok(by_labels
        .into_iter()
        .map(|(labels, points)| {
            let mut series = Series::new(decode_pairs(&labels).into_iter().collect(), points);
            series.sort_points();
            series
        })
        .collect())
}

fn read_list(conn: &Connection, sql: &str, max_rows: usize) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params![])?;

    let mut list = Vec::new();
    while let Some(row) = rows.next()? {
        check_row_limit(list.len() + 1, max_rows)?;

        let timestamp: i64 = row.get(0)?;
        let id: Option<String> = row.get(1)?;
        let data: Option<String> = row.get(2)?;

        let mut fields: BTreeMap<String, Value> = decode_pairs(&data.unwrap_or_default())
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        fields.insert("id".to_string(), Value::String(id.unwrap_or_default()));
        list.push(Row {
            timestamp,
            data: fields,
        });
    }
    Ok(list)
}

#[async_trait]
impl QueryExecutor for DuckDbReader {
    async fn execute_series(&self, ctx: &RequestContext, query: &str) -> Result<Vec<Series>> {
        ctx.check()?;
        debug!(request_id = %ctx.request_id(), query, "executing series query");
        let sql = query.to_string();
        self.run_blocking(move |conn, max_rows| read_series(conn, &sql, max_rows))
            .await
    }

    async fn execute_list(&self, ctx: &RequestContext, query: &str) -> Result<Vec<Row>> {
        ctx.check()?;
        debug!(request_id = %ctx.request_id(), query, "executing list query");
        let sql = query.to_string();
        self.run_blocking(move |conn, max_rows| read_list(conn, &sql, max_rows))
            .await
    }

    async fn execute_prom(
        &self,
        _ctx: &RequestContext,
        _query: &str,
        _start: i64,
        _end: i64,
        _step: i64,
    ) -> Result<Vec<Series>> {
        Err(QuerierError::Compilation(
            "PromQL is not supported by the DuckDB reader".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::CompileOptions;
    use crate::compile::QueryCompiler;
    use crate::models::{AggregateOperator, AttributeKey, BuilderQuery, DataSource, PanelType};
    use crate::sql::{LogsCompiler, MetricsCompiler};

    fn seeded() -> DuckDbReader {
        let reader = DuckDbReader::open_in_memory().unwrap();
        reader
            .execute_batch(
                "INSERT INTO metric_samples VALUES
                    ('http_requests_total', 60000, 1.0, MAP(['service'], ['api'])),
                    ('http_requests_total', 90000, 2.0, MAP(['service'], ['api'])),
                    ('http_requests_total', 120000, 5.0, MAP(['service'], ['web'])),
                    ('cpu', 60000, 0.5, MAP(['service'], ['api']));
                 INSERT INTO logs VALUES
                    ('0001', 1000, 'INFO', 'started', MAP(['service'], ['api'])),
                    ('0002', 2000, 'ERROR', 'timeout', MAP(['service'], ['api'])),
                    ('0003', 3000, 'INFO', 'done', MAP(['service'], ['web']));",
            )
            .unwrap();
        reader
    }

    #[tokio::test]
    async fn test_series_query_groups_by_labels() {
        let reader = seeded();
        let mut query = BuilderQuery::new("A", DataSource::Metrics);
        query.aggregate_operator = AggregateOperator::Sum;
        query.aggregate_attribute = AttributeKey::attribute("http_requests_total");
        query.group_by = vec![AttributeKey::attribute("service")];
        let sql = MetricsCompiler
            .compile(&query, 0, 180_000, PanelType::Graph, &CompileOptions::default())
            .unwrap();

        let series = reader
            .execute_series(&RequestContext::new(), &sql)
            .await
            .unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].labels["service"], "api");
        assert_eq!(series[0].points, vec![Point::new(60_000, 3.0)]);
        assert_eq!(series[1].labels["service"], "web");
        assert_eq!(series[1].points, vec![Point::new(120_000, 5.0)]);
    }

    #[tokio::test]
    async fn test_list_query_decodes_rows() {
        let reader = seeded();
        let mut query = BuilderQuery::new("A", DataSource::Logs);
        query.page_size = 2;
        let sql = LogsCompiler
            .compile(&query, 0, 10_000, PanelType::List, &CompileOptions::default())
            .unwrap();

        let rows = reader
            .execute_list(&RequestContext::new(), &sql)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, 3000);
        assert_eq!(rows[0].id(), Some("0003"));
        assert_eq!(rows[1].data["severity_text"], Value::String("ERROR".into()));
    }

    #[tokio::test]
    async fn test_row_limit_is_a_resource_limit() {
        let reader = seeded().with_max_result_rows(1);
        let query = BuilderQuery::new("A", DataSource::Logs);
        let sql = LogsCompiler
            .compile(&query, 0, 10_000, PanelType::List, &CompileOptions::default())
            .unwrap();

        let err = reader
            .execute_list(&RequestContext::new(), &sql)
            .await
            .unwrap_err();
        assert!(err.is_resource_limit());
    }

    #[tokio::test]
    async fn test_bad_sql_is_a_database_error() {
        let reader = seeded();
        let err = reader
            .execute_series(&RequestContext::new(), "SELECT * FROM nowhere")
            .await
            .unwrap_err();
        assert!(matches!(err, QuerierError::Database(_)));
    }

    #[tokio::test]
    async fn test_prom_is_unsupported() {
        let reader = seeded();
        let err = reader
            .execute_prom(&RequestContext::new(), "up", 0, 1, 60)
            .await
            .unwrap_err();
        assert!(matches!(err, QuerierError::Compilation(_)));
    }
}
