use super::{quote_literal, SeriesQuery};
use crate::compile::{CompileOptions, QueryCompiler};
use crate::models::{BuilderQuery, PanelType};
use crate::{QuerierError, Result};

/// Compiles metrics queries against `metric_samples`. The aggregate
/// attribute names the metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCompiler;

impl QueryCompiler for MetricsCompiler {
    fn compile(
        &self,
        query: &BuilderQuery,
        start: i64,
        end: i64,
        panel_type: PanelType,
        options: &CompileOptions,
    ) -> Result<String> {
        let metric = &query.aggregate_attribute.key;
        if metric.is_empty() {
            return Err(QuerierError::Compilation(format!(
                "query {} has no metric name",
                query.query_name
            )));
        }

        SeriesQuery {
            table: "metric_samples",
            query,
            value_expr: Some("value".to_string()),
            conditions: vec![format!("metric_name = {}", quote_literal(metric))],
        }
        .compile(start, end, panel_type, options)
    }
}
