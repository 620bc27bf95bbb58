use super::{attribute_expr, ListQuery, SeriesQuery};
use crate::compile::{CompileOptions, QueryCompiler};
use crate::models::{BuilderQuery, PanelType};
use crate::Result;

const DEFAULT_COLUMNS: &[&str] = &["severity_text", "body"];

/// Compiles logs queries against the `logs` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogsCompiler;

impl QueryCompiler for LogsCompiler {
    fn compile(
        &self,
        query: &BuilderQuery,
        start: i64,
        end: i64,
        panel_type: PanelType,
        options: &CompileOptions,
    ) -> Result<String> {
        match panel_type {
            PanelType::List | PanelType::Trace => {
                let limit = if query.page_size > 0 {
                    query.page_size
                } else {
                    query.limit
                };
                ListQuery {
                    table: "logs",
                    query,
                    id_column: "id",
                    default_columns: DEFAULT_COLUMNS,
                    limit,
                }
                .compile(start, end)
            }
            _ => {
                let value_expr = if query.aggregate_attribute.key.is_empty() {
                    None
                } else {
                    Some(attribute_expr(&query.aggregate_attribute)?)
                };
                SeriesQuery {
                    table: "logs",
                    query,
                    value_expr,
                    conditions: Vec::new(),
                }
                .compile(start, end, panel_type, options)
            }
        }
    }
}
