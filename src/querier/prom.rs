use super::{ChannelResult, Querier, RequestContext};
use crate::cache::range::series_from_cached_data;
use crate::cache::CachedSeriesData;
use crate::metrics;
use crate::models::{PanelType, QueryRangeParams, Series};
use crate::{QuerierError, Result};
use std::collections::HashMap;

/// Fill the `{{start_ms}}`, `{{end_ms}}` and `{{step}}` variables of a raw
/// query.
pub(super) fn render_raw_query(query: &str, start: i64, end: i64, step: i64) -> String {
    query
        .replace("{{start_ms}}", &start.to_string())
        .replace("{{end_ms}}", &end.to_string())
        .replace("{{step}}", &step.to_string())
}

impl Querier {
    async fn execute_prom(
        &self,
        ctx: &RequestContext,
        query: &str,
        start: i64,
        end: i64,
        step: i64,
    ) -> Result<Vec<Series>> {
        self.record(query, start, end);
        ctx.run(self.executor.execute_prom(ctx, query, start, end, step))
            .await
    }

    pub(super) async fn run_prom_query(
        &self,
        ctx: &RequestContext,
        params: &QueryRangeParams,
        keys: &HashMap<String, String>,
        name: &str,
    ) -> ChannelResult {
        let Some(prom) = params.composite_query.prom_queries.get(name) else {
            return ChannelResult::failed(
                name,
                QuerierError::Internal(format!("unknown query {}", name)),
                String::new(),
            );
        };
        let query = prom.query.as_str();

        let Some(cache_key) = self.usable_cache_key(params, keys, name) else {
            return match self
                .execute_prom(ctx, query, params.start, params.end, params.step)
                .await
            {
                Ok(series) => ChannelResult::series(name, series, query.to_string()),
                Err(e) => ChannelResult::failed(name, e, query.to_string()),
            };
        };

        let result: Result<Vec<Series>> = async {
            let misses = self
                .cache
                .find_missing_time_ranges(params.start, params.end, params.step, cache_key)
                .await;
            metrics::record_miss_intervals(misses.len());

            let mut fetched = Vec::with_capacity(misses.len());
            for miss in &misses {
                let series = self
                    .execute_prom(ctx, query, miss.start, miss.end, params.step)
                    .await?;
                fetched.push(CachedSeriesData::from_window(miss.start, miss.end, series));
            }
            let merged = self
                .cache
                .merge_with_cached_series_data(cache_key, fetched)
                .await;
            Ok(series_from_cached_data(&merged, params.start, params.end))
        }
        .await;

        match result {
            Ok(series) => ChannelResult::series(name, series, query.to_string()),
            Err(e) => ChannelResult::failed(name, e, query.to_string()),
        }
    }

    /// Raw queries always run fresh over the whole window.
    pub(super) async fn run_sql_query(
        &self,
        ctx: &RequestContext,
        params: &QueryRangeParams,
        name: &str,
    ) -> ChannelResult {
        let Some(raw) = params.composite_query.sql_queries.get(name) else {
            return ChannelResult::failed(
                name,
                QuerierError::Internal(format!("unknown query {}", name)),
                String::new(),
            );
        };
        let query = render_raw_query(&raw.query, params.start, params.end, params.step);

        match params.composite_query.panel_type {
            PanelType::List | PanelType::Trace => {
                match self.execute_list(ctx, &query, params.start, params.end).await {
                    Ok(rows) => ChannelResult::list(name, rows, query),
                    Err(e) => ChannelResult::failed(name, e, query),
                }
            }
            _ => match self
                .execute_series(ctx, &query, params.start, params.end)
                .await
            {
                Ok(series) => ChannelResult::series(name, series, query),
                Err(e) => ChannelResult::failed(name, e, query),
            },
        }
    }
}
