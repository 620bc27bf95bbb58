//! List (logs/traces rows) queries.
//!
//! A single list query ordered by timestamp is answered by scanning
//! progressively larger windows from the newest edge of the range (or the
//! oldest, for ascending order) until a page is filled, so the common case
//! only touches the most recent hour.

use super::{shifted_window, ChannelResult, Querier, RequestContext};
use crate::models::{
    AttributeKey, BuilderQuery, DataSource, FilterItem, FilterOperator, QueryRangeParams, Row,
    SortOrder,
};
use crate::{QuerierError, Result};
use serde_json::Value;
use tracing::debug;

const HOUR_MS: i64 = 60 * 60 * 1000;

/// Windows covering `[start, end]` newest first: one hour, then two, four,
/// eight... hours back from `end`, the last one clipped to `start`. Ranges
/// of an hour or less are a single window.
pub fn list_time_ranges(start: i64, end: i64) -> Vec<(i64, i64)> {
    if end - start <= HOUR_MS {
        return vec![(start, end)];
    }

    let mut ranges = Vec::new();
    let mut bucket = HOUR_MS;
    let mut window_end = end;
    let mut window_start = end - bucket;
    loop {
        if window_start <= start {
            ranges.push((start, window_end));
            break;
        }
        ranges.push((window_start, window_end));
        bucket *= 2;
        window_end = window_start;
        window_start -= bucket;
    }
    ranges
}

/// Only a single logs/traces query ordered by timestamp is paginated
/// window by window.
pub(super) fn is_windowed(query: &BuilderQuery) -> bool {
    matches!(query.data_source, DataSource::Logs | DataSource::Traces)
        && query.timestamp_order().is_some()
}

impl Querier {
    pub(super) async fn run_list_query(
        &self,
        ctx: &RequestContext,
        params: &QueryRangeParams,
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

        let compiled = match self
            .builder
            .compile(query, start, end, params.composite_query.panel_type)
        {
            Ok(compiled) => compiled,
            Err(e) => return ChannelResult::failed(name, e, String::new()),
        };
        match self.execute_list(ctx, &compiled, start, end).await {
            Ok(rows) => ChannelResult::list(name, rows, compiled),
            Err(e) => ChannelResult::failed(name, e, compiled),
        }
    }

    pub(super) async fn run_window_based_list_query(
        &self,
        ctx: &RequestContext,
        params: &QueryRangeParams,
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

        let mut last_query = String::new();
        match self
            .paginate(ctx, params, query, start, end, &mut last_query)
            .await
        {
            Ok(rows) => ChannelResult::list(name, rows, last_query),
            Err(e) => ChannelResult::failed(name, e, last_query),
        }
    }

    async fn paginate(
        &self,
        ctx: &RequestContext,
        params: &QueryRangeParams,
        base: &BuilderQuery,
        start: i64,
        end: i64,
        last_query: &mut String,
    ) -> Result<Vec<Row>> {
        let order = base.timestamp_order().unwrap_or_default();
        let logs = base.data_source == DataSource::Logs;

        // Rows to fetch in total and rows to return.
        let (total, wanted) = if logs {
            if base.limit > 0 && base.offset + base.page_size > base.limit {
                return Err(QuerierError::Validation(format!(
                    "max limit exceeded: offset {} + page size {} is more than limit {}",
                    base.offset, base.page_size, base.limit
                )));
            }
            (base.page_size + base.offset, base.page_size)
        } else {
            let total = base.limit + base.offset;
            if total > self.max_trace_pagination {
                return Err(QuerierError::Validation(format!(
                    "maximum traces that can be paginated is {}",
                    self.max_trace_pagination
                )));
            }
            (total, base.limit)
        };

        let mut windows = list_time_ranges(start, end);
        if order == SortOrder::Asc {
            windows.reverse();
        }

        let mut remaining = total;
        let mut to_skip = base.offset;
        let mut last_id: Option<String> = None;
        let mut data = Vec::new();

        for (window_start, window_end) in windows {
            let mut query = base.clone();
            query.offset = 0;
            if logs {
                query.page_size = remaining;
                query.limit = 0;
                if let Some(id) = &last_id {
                    let operator = match order {
                        SortOrder::Desc => FilterOperator::Lt,
                        SortOrder::Asc => FilterOperator::Gt,
                    };
                    query.filters.items.push(FilterItem {
                        key: AttributeKey::column("id"),
                        operator,
                        value: Value::String(id.clone()),
                    });
                }
            } else {
                query.limit = remaining;
            }

            let compiled = self.builder.compile(
                &query,
                window_start,
                window_end,
                params.composite_query.panel_type,
            )?;
            *last_query = compiled.clone();
            let rows = self
                .execute_list(ctx, &compiled, window_start, window_end)
                .await?;
            debug!(window_start, window_end, rows = rows.len(), "scanned list window");

            if let Some(id) = rows.last().and_then(Row::id) {
                last_id = Some(id.to_string());
            }
            remaining = remaining.saturating_sub(rows.len() as u64);
            for row in rows {
                if to_skip > 0 {
                    to_skip -= 1;
                    continue;
                }
                data.push(row);
            }

            if data.len() as u64 >= wanted {
                break;
            }
        }

        Ok(data)
    }
}
