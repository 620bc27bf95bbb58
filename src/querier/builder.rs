use super::{shifted_window, ChannelResult, Querier, RequestContext};
use crate::cache::range::{merge_intervals, series_from_cached_data};
use crate::cache::{BoundaryTruncation, CachedSeriesData, MissInterval};
use crate::compile::{expression_variables, QueryBuilder};
use crate::metrics;
use crate::models::{BuilderQuery, DataSource, QueryRangeParams, Series};
use crate::{QuerierError, Result};
use std::collections::HashMap;
use tracing::debug;

impl Querier {
    /// The cache key for `name`, if this request may use the cache for it.
    pub(super) fn usable_cache_key<'a>(
        &self,
        params: &QueryRangeParams,
        keys: &'a HashMap<String, String>,
        name: &str,
    ) -> Option<&'a str> {
        if params.no_cache || !self.cache.is_enabled() {
            return None;
        }
        keys.get(name).map(String::as_str).filter(|k| !k.is_empty())
    }

    pub(super) async fn run_builder_query(
        &self,
        ctx: &RequestContext,
        params: &QueryRangeParams,
        keys: &HashMap<String, String>,
        name: &str,
    ) -> ChannelResult {
        let Some(query) = params.composite_query.builder_queries.get(name) else {
            return ChannelResult::failed(
                name,
                QuerierError::Internal(format!("unknown query {}", name)),
                String::new(),
            );
        };
        let (start, end) = shifted_window(params.start, params.end, query.shift_by);
        let panel_type = params.composite_query.panel_type;

        let cache_key = match query.data_source {
            DataSource::Traces => None,
            // Group selection has to see the whole window, never one miss.
            _ if QueryBuilder::needs_graph_limit(query, panel_type) => None,
            DataSource::Logs | DataSource::Metrics => self.usable_cache_key(params, keys, name),
        };

        let Some(cache_key) = cache_key else {
            return self.run_fresh(ctx, params, name, query, start, end).await;
        };

        let mut last_query = String::new();
        let result = self
            .run_cached(ctx, params, query, cache_key, (start, end), &mut last_query)
            .await;
        match result {
            Ok(series) => ChannelResult::series(name, series, last_query),
            Err(e) => ChannelResult::failed(name, e, last_query),
        }
    }

    async fn run_fresh(
        &self,
        ctx: &RequestContext,
        params: &QueryRangeParams,
        name: &str,
        query: &BuilderQuery,
        start: i64,
        end: i64,
    ) -> ChannelResult {
        let compiled =
            match self
                .builder
                .compile(query, start, end, params.composite_query.panel_type)
            {
                Ok(compiled) => compiled,
                Err(e) => return ChannelResult::failed(name, e, String::new()),
            };

        match self.execute_series(ctx, &compiled, start, end).await {
            Ok(series) => ChannelResult::series(name, series, compiled),
            Err(e) => ChannelResult::failed(name, e, compiled),
        }
    }

    /// Fetch the misses one after another, merge them into the cache and
    /// answer from the merged intervals.
    async fn run_cached(
        &self,
        ctx: &RequestContext,
        params: &QueryRangeParams,
        query: &BuilderQuery,
        cache_key: &str,
        (start, end): (i64, i64),
        last_query: &mut String,
    ) -> Result<Vec<Series>> {
        let step = query.step_interval;
        let truncation = match query.data_source {
            DataSource::Logs => self.log_truncation,
            _ => BoundaryTruncation::AggregationWindow,
        };
        let misses = self
            .cache
            .find_missing_time_ranges(start, end, step, cache_key)
            .await;
        metrics::record_miss_intervals(misses.len());

        let mut fetched = Vec::with_capacity(misses.len());
        for miss in misses {
            let compiled = self.builder.compile(
                query,
                miss.start,
                miss.end,
                params.composite_query.panel_type,
            )?;
            *last_query = compiled.clone();
            let series = self
                .execute_series(ctx, &compiled, miss.start, miss.end)
                .await?;
            fetched.push((miss, series));
        }

        Ok(self
            .merge_fetched(cache_key, truncation, step, fetched, start, end)
            .await)
    }

    /// Cache the complete buckets of every fetched miss and answer from the
    /// cache plus the raw fetch.
    ///
    /// A bucket cut by a miss boundary holds a partial aggregate. It is
    /// still part of this response but never enters the cache, so a later
    /// request recomputes it in full.
    async fn merge_fetched(
        &self,
        cache_key: &str,
        truncation: BoundaryTruncation,
        step: i64,
        fetched: Vec<(MissInterval, Vec<Series>)>,
        start: i64,
        end: i64,
    ) -> Vec<Series> {
        let mut raw = Vec::with_capacity(fetched.len());
        let mut to_cache = Vec::with_capacity(fetched.len());
        for (miss, series) in fetched {
            let (filtered, cached_start, cached_end) =
                truncation.filter_series_points(&series, miss.start, miss.end, step);
            // Empty after truncation means partial buckets only; an empty
            // fetch is a real result and is cached.
            if !filtered.is_empty() || series.is_empty() {
                to_cache.push(CachedSeriesData::from_window(
                    cached_start,
                    cached_end,
                    filtered,
                ));
            }
            raw.push(CachedSeriesData::from_window(miss.start, miss.end, series));
        }

        let misses = raw.len();
        let mut all = self
            .cache
            .merge_with_cached_series_data(cache_key, to_cache)
            .await;
        all.extend(raw);
        let merged = merge_intervals(all);
        debug!(
            cache_key,
            misses,
            intervals = merged.len(),
            "merged fetched data with cache"
        );

        series_from_cached_data(&merged, start, end)
    }

    pub(super) async fn run_builder_expression(
        &self,
        ctx: &RequestContext,
        params: &QueryRangeParams,
        keys: &HashMap<String, String>,
        name: &str,
    ) -> ChannelResult {
        let Some(formula) = params.composite_query.builder_queries.get(name) else {
            return ChannelResult::failed(
                name,
                QuerierError::Internal(format!("unknown formula {}", name)),
                String::new(),
            );
        };

        let referenced: Vec<&BuilderQuery> = expression_variables(&formula.expression)
            .iter()
            .filter_map(|v| params.composite_query.builder_queries.get(v))
            .collect();
        let panel_type = params.composite_query.panel_type;
        let uncacheable = referenced.iter().any(|q| {
            q.data_source == DataSource::Traces || QueryBuilder::needs_graph_limit(q, panel_type)
        });
        let step = referenced
            .iter()
            .map(|q| q.step_interval)
            .max()
            .unwrap_or(params.step);

        let cache_key = if uncacheable {
            None
        } else {
            self.usable_cache_key(params, keys, name)
        };

        let Some(cache_key) = cache_key else {
            let compiled = match self
                .builder
                .compile_expression(name, params, params.start, params.end)
            {
                Ok(compiled) => compiled,
                Err(e) => return ChannelResult::failed(name, e, String::new()),
            };
            return match self
                .execute_series(ctx, &compiled, params.start, params.end)
                .await
            {
                Ok(series) => ChannelResult::series(name, series, compiled),
                Err(e) => ChannelResult::failed(name, e, compiled),
            };
        };

        let mut last_query = String::new();
        let result: Result<Vec<Series>> = async {
            let misses = self
                .cache
                .find_missing_time_ranges(params.start, params.end, step, cache_key)
                .await;
            metrics::record_miss_intervals(misses.len());

            let mut fetched = Vec::with_capacity(misses.len());
            for miss in misses {
                let compiled = self
                    .builder
                    .compile_expression(name, params, miss.start, miss.end)?;
                last_query = compiled.clone();
                let series = self
                    .execute_series(ctx, &compiled, miss.start, miss.end)
                    .await?;
                fetched.push((miss, series));
            }

            Ok(self
                .merge_fetched(
                    cache_key,
                    BoundaryTruncation::AggregationWindow,
                    step,
                    fetched,
                    params.start,
                    params.end,
                )
                .await)
        }
        .await;

        match result {
            Ok(series) => ChannelResult::series(name, series, last_query),
            Err(e) => ChannelResult::failed(name, e, last_query),
        }
    }
}
