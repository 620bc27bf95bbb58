//! Query-range orchestration.
//!
//! A request is split into units (one per enabled named query). Every unit
//! runs in its own task; results come back over a channel and are matched
//! to their query by name. Cache-eligible units consult the
//! [`TimeRangeCache`] and only fetch the sub-ranges it reports missing.

mod builder;
mod context;
mod list;
mod prom;

pub use context::RequestContext;
pub use list::list_time_ranges;

use crate::cache::{
    BoundaryTruncation, ByteCache, CacheKeyGenerator, ShapeKeyGenerator, TimeRangeCache,
};
use crate::compile::QueryBuilder;
use crate::config::QuerierConfig;
use crate::metrics;
use crate::models::{PanelType, QueryRangeParams, QueryResult, QueryType, Row, Series};
use crate::reader::QueryExecutor;
use crate::QuerierError;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info_span, Instrument};

/// Largest `limit + offset` a paginated traces list may ask for.
pub const DEFAULT_MAX_TRACE_PAGINATION: u64 = 10_000;

pub struct QuerierOptions {
    pub executor: Arc<dyn QueryExecutor>,
    pub builder: QueryBuilder,
    pub cache: Option<Arc<dyn ByteCache>>,
    pub key_generator: Arc<dyn CacheKeyGenerator>,
    pub flux_interval: Duration,
    pub cache_ttl: Duration,
    pub max_trace_pagination: u64,
    pub log_truncation: BoundaryTruncation,
    /// Keep every executed query and window for [`Querier::queries_executed`]
    /// and [`Querier::time_ranges`].
    pub record_executions: bool,
}

impl QuerierOptions {
    pub fn new(executor: Arc<dyn QueryExecutor>, builder: QueryBuilder) -> Self {
        Self {
            executor,
            builder,
            cache: None,
            key_generator: Arc::new(ShapeKeyGenerator),
            flux_interval: Duration::from_secs(300),
            cache_ttl: Duration::from_secs(3600),
            max_trace_pagination: DEFAULT_MAX_TRACE_PAGINATION,
            log_truncation: BoundaryTruncation::default(),
            record_executions: false,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ByteCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_config(mut self, config: &QuerierConfig) -> Self {
        self.flux_interval = Duration::from_secs(config.flux_interval_secs);
        self.cache_ttl = Duration::from_secs(config.cache_ttl_secs);
        self.max_trace_pagination = config.max_trace_pagination;
        self.log_truncation = config.log_boundary_truncation;
        self
    }
}

#[derive(Default)]
struct ExecutionLog {
    queries: Mutex<Vec<String>>,
    time_ranges: Mutex<Vec<[i64; 2]>>,
}

/// Outcome of [`Querier::query_range`].
#[derive(Debug, Default)]
pub struct QueryRangeOutput {
    /// Successful results, ordered by query name.
    pub results: Vec<QueryResult>,
    /// Caller-visible failures by query name. Builder requests only list
    /// resource-limit errors here.
    pub errors_by_query: BTreeMap<String, QuerierError>,
    /// Set when any unit failed, the request was cancelled, or a value
    /// panel got more than one series.
    pub error: Option<QuerierError>,
}

/// Output of one unit, consumed once by the fan-in loop.
#[derive(Debug, Default)]
struct ChannelResult {
    name: String,
    series: Vec<Series>,
    list: Vec<Row>,
    err: Option<QuerierError>,
    /// Last compiled query, for diagnostics.
    query: String,
}

impl ChannelResult {
    fn series(name: &str, series: Vec<Series>, query: String) -> Self {
        Self {
            name: name.to_string(),
            series,
            query,
            ..Default::default()
        }
    }

    fn list(name: &str, list: Vec<Row>, query: String) -> Self {
        Self {
            name: name.to_string(),
            list,
            query,
            ..Default::default()
        }
    }

    fn failed(name: &str, err: QuerierError, query: String) -> Self {
        Self {
            name: name.to_string(),
            err: Some(err),
            query,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
enum Unit {
    Builder(String),
    Expression(String),
    List(String),
    WindowedList(String),
    Prom(String),
    Sql(String),
}

impl Unit {
    fn name(&self) -> &str {
        match self {
            Unit::Builder(name)
            | Unit::Expression(name)
            | Unit::List(name)
            | Unit::WindowedList(name)
            | Unit::Prom(name)
            | Unit::Sql(name) => name,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Unit::Builder(_) => "builder",
            Unit::Expression(_) => "expression",
            Unit::List(_) => "list",
            Unit::WindowedList(_) => "windowed_list",
            Unit::Prom(_) => "promql",
            Unit::Sql(_) => "sql",
        }
    }
}

#[derive(Clone)]
pub struct Querier {
    cache: TimeRangeCache,
    key_generator: Arc<dyn CacheKeyGenerator>,
    builder: Arc<QueryBuilder>,
    executor: Arc<dyn QueryExecutor>,
    max_trace_pagination: u64,
    log_truncation: BoundaryTruncation,
    executions: Option<Arc<ExecutionLog>>,
}

impl Querier {
    pub fn new(options: QuerierOptions) -> Self {
        Self {
            cache: TimeRangeCache::new(options.cache, options.flux_interval)
                .with_ttl(options.cache_ttl),
            key_generator: options.key_generator,
            builder: Arc::new(options.builder),
            executor: options.executor,
            max_trace_pagination: options.max_trace_pagination,
            log_truncation: options.log_truncation,
            executions: options
                .record_executions
                .then(|| Arc::new(ExecutionLog::default())),
        }
    }

    /// Every compiled query executed so far, in execution order. Empty
    /// unless recording is enabled.
    pub fn queries_executed(&self) -> Vec<String> {
        self.executions
            .as_ref()
            .map(|log| log.queries.lock().clone())
            .unwrap_or_default()
    }

    /// The `[start, end]` window of every executed query.
    pub fn time_ranges(&self) -> Vec<[i64; 2]> {
        self.executions
            .as_ref()
            .map(|log| log.time_ranges.lock().clone())
            .unwrap_or_default()
    }

    pub async fn query_range(
        &self,
        ctx: &RequestContext,
        params: &QueryRangeParams,
    ) -> QueryRangeOutput {
        let _timer = metrics::RequestTimer::new();
        let composite = &params.composite_query;
        let span = info_span!(
            "query_range",
            request_id = %ctx.request_id(),
            query_type = ?composite.query_type,
            panel_type = ?composite.panel_type,
        );

        async {
            if let Err(e) = params.validate() {
                return QueryRangeOutput {
                    error: Some(e),
                    ..Default::default()
                };
            }
            let units = self.plan_units(params);
            debug!(units = units.len(), "dispatching query units");
            let outcomes = self.fan_out(ctx, params, units).await;
            self.fan_in(ctx, params, outcomes)
        }
        .instrument(span)
        .await
    }

    fn plan_units(&self, params: &QueryRangeParams) -> Vec<Unit> {
        let composite = &params.composite_query;
        match composite.query_type {
            QueryType::Builder => {
                let enabled: Vec<_> = composite
                    .builder_queries
                    .iter()
                    .filter(|(_, q)| !q.disabled)
                    .collect();
                let list_panel =
                    matches!(composite.panel_type, PanelType::List | PanelType::Trace);

                if list_panel {
                    if let [(name, query)] = enabled.as_slice() {
                        if list::is_windowed(query) {
                            return vec![Unit::WindowedList(name.to_string())];
                        }
                    }
                    return enabled
                        .into_iter()
                        .map(|(name, _)| Unit::List(name.clone()))
                        .collect();
                }

                enabled
                    .into_iter()
                    .map(|(name, query)| {
                        if query.is_expression() {
                            Unit::Expression(name.clone())
                        } else {
                            Unit::Builder(name.clone())
                        }
                    })
                    .collect()
            }
            QueryType::PromQl => composite
                .prom_queries
                .iter()
                .filter(|(_, q)| !q.disabled)
                .map(|(name, _)| Unit::Prom(name.clone()))
                .collect(),
            QueryType::Sql => composite
                .sql_queries
                .iter()
                .filter(|(_, q)| !q.disabled)
                .map(|(name, _)| Unit::Sql(name.clone()))
                .collect(),
        }
    }

    /// Run every unit in its own task and wait for all of them.
    async fn fan_out(
        &self,
        ctx: &RequestContext,
        params: &QueryRangeParams,
        units: Vec<Unit>,
    ) -> Vec<ChannelResult> {
        if units.is_empty() {
            return Vec::new();
        }

        let params = Arc::new(params.clone());
        let keys = Arc::new(self.key_generator.generate_keys(&params));
        let (tx, mut rx) = mpsc::channel(units.len());

        let mut handles = Vec::with_capacity(units.len());
        for unit in units {
            metrics::record_unit(unit.kind());
            let querier = self.clone();
            let ctx = ctx.clone();
            let params = params.clone();
            let keys = keys.clone();
            let tx = tx.clone();
            let name = unit.name().to_string();

            let handle = tokio::spawn(
                async move {
                    let result = querier.run_unit(&ctx, &params, &keys, &unit).await;
                    if result.err.is_some() {
                        metrics::record_unit_failure(unit.kind());
                    }
                    if tx.send(result).await.is_err() {
                        error!("Result receiver dropped for query {}", unit.name());
                    }
                }
                .in_current_span(),
            );
            handles.push((name, handle));
        }
        drop(tx);

        let joined = join_all(
            handles
                .into_iter()
                .map(|(name, handle)| async move { (name, handle.await) }),
        )
        .await;

        let mut outcomes = Vec::with_capacity(joined.len());
        for (name, result) in joined {
            if let Err(e) = result {
                outcomes.push(ChannelResult::failed(
                    &name,
                    QuerierError::Internal(format!("query task failed: {}", e)),
                    String::new(),
                ));
            }
        }
        while let Some(result) = rx.recv().await {
            outcomes.push(result);
        }
        outcomes
    }

    async fn run_unit(
        &self,
        ctx: &RequestContext,
        params: &QueryRangeParams,
        keys: &HashMap<String, String>,
        unit: &Unit,
    ) -> ChannelResult {
        match unit {
            Unit::Builder(name) => self.run_builder_query(ctx, params, keys, name).await,
            Unit::Expression(name) => self.run_builder_expression(ctx, params, keys, name).await,
            Unit::List(name) => self.run_list_query(ctx, params, name).await,
            Unit::WindowedList(name) => self.run_window_based_list_query(ctx, params, name).await,
            Unit::Prom(name) => self.run_prom_query(ctx, params, keys, name).await,
            Unit::Sql(name) => self.run_sql_query(ctx, params, name).await,
        }
    }

    fn fan_in(
        &self,
        ctx: &RequestContext,
        params: &QueryRangeParams,
        outcomes: Vec<ChannelResult>,
    ) -> QueryRangeOutput {
        let composite = &params.composite_query;
        let builder_request = composite.query_type == QueryType::Builder;

        let mut output = QueryRangeOutput::default();
        let mut failures = Vec::new();
        for outcome in outcomes {
            if let Some(err) = outcome.err {
                let err = match err {
                    QuerierError::Unit { .. } => err,
                    other => other.in_query(&outcome.name),
                };
                error!(
                    query_name = %outcome.name,
                    query = %outcome.query,
                    "Query failed: {}",
                    err
                );

                if !builder_request || err.is_resource_limit() {
                    output.errors_by_query.insert(outcome.name, err.clone());
                }
                failures.push(err);
                continue;
            }

            output.results.push(QueryResult {
                query_name: outcome.name,
                series: outcome.series,
                list: outcome.list,
            });
        }
        output.results.sort_by(|a, b| a.query_name.cmp(&b.query_name));

        output.error = aggregate_error(ctx, builder_request, &failures);

        if composite.panel_type == PanelType::Value {
            if output.results.len() > 1 {
                output.error = Some(QuerierError::Validation(
                    "there can be only one active query for value type panel".to_string(),
                ));
            } else if let Some(result) = output.results.first() {
                if result.series.len() > 1 {
                    output.error = Some(QuerierError::Validation(format!(
                        "there can be only one result series for value type panel but got {}",
                        result.series.len()
                    )));
                }
            }
        }

        output
    }

    fn record(&self, query: &str, start: i64, end: i64) {
        metrics::record_query_executed();
        if let Some(log) = &self.executions {
            log.queries.lock().push(query.to_string());
            log.time_ranges.lock().push([start, end]);
        }
    }

    async fn execute_series(
        &self,
        ctx: &RequestContext,
        query: &str,
        start: i64,
        end: i64,
    ) -> crate::Result<Vec<Series>> {
        self.record(query, start, end);
        let mut series = ctx.run(self.executor.execute_series(ctx, query)).await?;
        drop_non_positive_points(&mut series, query);
        Ok(series)
    }

    async fn execute_list(
        &self,
        ctx: &RequestContext,
        query: &str,
        start: i64,
        end: i64,
    ) -> crate::Result<Vec<Row>> {
        self.record(query, start, end);
        ctx.run(self.executor.execute_list(ctx, query)).await
    }
}

/// One error for the whole request. Cancellation wins; user-actionable
/// errors come next; other builder failures collapse into a generic error
/// so storage details stay in the logs.
fn aggregate_error(
    ctx: &RequestContext,
    builder_request: bool,
    failures: &[QuerierError],
) -> Option<QuerierError> {
    if ctx.is_cancelled() {
        return Some(QuerierError::Cancelled);
    }
    if failures.is_empty() {
        return None;
    }

    let roots: Vec<&QuerierError> = failures.iter().map(|e| e.root_cause()).collect();
    if roots.iter().any(|e| matches!(e, QuerierError::DeadlineExceeded)) {
        return Some(QuerierError::DeadlineExceeded);
    }
    if roots.iter().any(|e| matches!(e, QuerierError::Cancelled)) {
        return Some(QuerierError::Cancelled);
    }
    let user_facing = failures.iter().find(|e| {
        matches!(
            e.root_cause(),
            QuerierError::Validation(_) | QuerierError::Compilation(_)
        )
    });
    if let Some(err) = user_facing {
        return Some(err.clone());
    }
    if let Some(err) = failures.iter().find(|e| e.is_resource_limit()) {
        return Some(err.clone());
    }

    if builder_request {
        return Some(QuerierError::Execution(
            "error in builder queries".to_string(),
        ));
    }
    if let [only] = failures {
        return Some(only.clone());
    }
    let messages: Vec<String> = failures.iter().map(|e| e.to_string()).collect();
    Some(QuerierError::Execution(format!(
        "encountered multiple errors: {}",
        messages.join("; ")
    )))
}

/// Points at or before the epoch come from broken ingestion and would
/// corrupt the interval bookkeeping.
fn drop_non_positive_points(series: &mut [Series], query: &str) {
    let mut dropped = 0;
    for s in series.iter_mut() {
        let before = s.points.len();
        s.points.retain(|p| p.timestamp > 0);
        dropped += before - s.points.len();
    }
    if dropped > 0 {
        error!(dropped, query, "Dropped points with non-positive timestamps");
    }
}

/// `[start, end]` moved back by `shift_by` seconds. The request has been
/// validated, so the shift fits in milliseconds.
fn shifted_window(start: i64, end: i64, shift_by: i64) -> (i64, i64) {
    let shift_ms = shift_by * 1000;
    (start - shift_ms, end - shift_ms)
}
