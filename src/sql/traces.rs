use super::{attribute_expr, ListQuery, SeriesQuery};
use crate::compile::{CompileOptions, QueryCompiler};
use crate::models::{BuilderQuery, PanelType};
use crate::Result;

const DEFAULT_COLUMNS: &[&str] = &[
    "trace_id",
    "span_id",
    "name",
    "service_name",
    "duration_nano",
    "has_error",
];

/// Compiles traces queries against the `spans` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracesCompiler;

impl QueryCompiler for TracesCompiler {
    fn compile(
        &self,
        query: &BuilderQuery,
        start: i64,
        end: i64,
        panel_type: PanelType,
        options: &CompileOptions,
    ) -> Result<String> {
        match panel_type {
            PanelType::List | PanelType::Trace => ListQuery {
                table: "spans",
                query,
                id_column: "span_id",
                default_columns: DEFAULT_COLUMNS,
                limit: query.limit,
            }
            .compile(start, end),
            _ => {
                let value_expr = if query.aggregate_attribute.key.is_empty() {
                    None
                } else {
                    Some(attribute_expr(&query.aggregate_attribute)?)
                };
                SeriesQuery {
                    table: "spans",
                    query,
                    value_expr,
                    conditions: Vec::new(),
                }
                .compile(start, end, panel_type, options)
            }
        }
    }
}
