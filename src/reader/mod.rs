//! Executes compiled queries against the store.

pub mod duckdb_reader;

pub use duckdb_reader::DuckDbReader;

use crate::models::{Row, Series};
use crate::querier::RequestContext;
use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run a series query, one row per `(labels, bucket, value)`.
    async fn execute_series(&self, ctx: &RequestContext, query: &str) -> Result<Vec<Series>>;

    /// Run a list query, one row per `(ts, id, data)`.
    async fn execute_list(&self, ctx: &RequestContext, query: &str) -> Result<Vec<Row>>;

    /// Run a PromQL query over `[start, end]` (ms) with `step` seconds.
    async fn execute_prom(
        &self,
        ctx: &RequestContext,
        query: &str,
        start: i64,
        end: i64,
        step: i64,
    ) -> Result<Vec<Series>>;
}
