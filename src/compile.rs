//! Query compilation seam.
//!
//! One [`QueryCompiler`] per data source turns a builder query and a
//! concrete window into executable query text. [`QueryBuilder`] keeps the
//! registration table and handles the two-phase "top N groups" templating
//! that graph panels with a limit and a group-by need.

use crate::models::{BuilderQuery, DataSource, PanelType, QueryRangeParams};
use crate::{QuerierError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Marker replaced by the group-selection query inside the value query.
pub const LIMIT_PLACEHOLDER: &str = "#LIMIT_PLACEHOLDER";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphLimitPhase {
    /// Select the top-N group keys over the whole window.
    GroupSelection,
    /// Full series, restricted to the groups returned by
    /// [`LIMIT_PLACEHOLDER`].
    Values,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileOptions {
    pub graph_limit: Option<GraphLimitPhase>,
}

impl CompileOptions {
    pub fn phase(phase: GraphLimitPhase) -> Self {
        Self {
            graph_limit: Some(phase),
        }
    }
}

/// Compiles builder queries of one data source. Must be pure.
pub trait QueryCompiler: Send + Sync {
    /// `start`/`end` are milliseconds; the step comes from the query.
    fn compile(
        &self,
        query: &BuilderQuery,
        start: i64,
        end: i64,
        panel_type: PanelType,
        options: &CompileOptions,
    ) -> Result<String>;
}

/// Compiles a formula given the compiled text of every query it references.
pub trait ExpressionCompiler: Send + Sync {
    fn compile_expression(
        &self,
        formula: &BuilderQuery,
        sub_queries: &BTreeMap<String, String>,
    ) -> Result<String>;
}

#[derive(Clone, Default)]
pub struct QueryBuilder {
    compilers: HashMap<DataSource, Arc<dyn QueryCompiler>>,
    expressions: Option<Arc<dyn ExpressionCompiler>>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compiler(
        mut self,
        data_source: DataSource,
        compiler: Arc<dyn QueryCompiler>,
    ) -> Self {
        self.register(data_source, compiler);
        self
    }

    pub fn with_expression_compiler(mut self, compiler: Arc<dyn ExpressionCompiler>) -> Self {
        self.expressions = Some(compiler);
        self
    }

    pub fn register(&mut self, data_source: DataSource, compiler: Arc<dyn QueryCompiler>) {
        self.compilers.insert(data_source, compiler);
    }

    /// Graph panels asking for the top N groups need a group-selection
    /// query nested in the value query.
    pub fn needs_graph_limit(query: &BuilderQuery, panel_type: PanelType) -> bool {
        panel_type == PanelType::Graph && query.limit > 0 && !query.group_by.is_empty()
    }

    fn compiler_for(&self, data_source: DataSource) -> Result<&Arc<dyn QueryCompiler>> {
        self.compilers.get(&data_source).ok_or_else(|| {
            QuerierError::Compilation(format!(
                "no compiler registered for data source {}",
                data_source.as_str()
            ))
        })
    }

    pub fn compile(
        &self,
        query: &BuilderQuery,
        start: i64,
        end: i64,
        panel_type: PanelType,
    ) -> Result<String> {
        let compiler = self.compiler_for(query.data_source)?;

        if !Self::needs_graph_limit(query, panel_type) {
            return compiler.compile(query, start, end, panel_type, &CompileOptions::default());
        }

        let limit_query = compiler.compile(
            query,
            start,
            end,
            panel_type,
            &CompileOptions::phase(GraphLimitPhase::GroupSelection),
        )?;
        let placeholder_query = compiler.compile(
            query,
            start,
            end,
            panel_type,
            &CompileOptions::phase(GraphLimitPhase::Values),
        )?;
        if !placeholder_query.contains(LIMIT_PLACEHOLDER) {
            return Err(QuerierError::Compilation(format!(
                "value query for {} has no {} to substitute",
                query.query_name, LIMIT_PLACEHOLDER
            )));
        }
        Ok(placeholder_query.replacen(LIMIT_PLACEHOLDER, &limit_query, 1))
    }

    /// Compile the formula `name` of `params` over `[start, end]`.
    pub fn compile_expression(
        &self,
        name: &str,
        params: &QueryRangeParams,
        start: i64,
        end: i64,
    ) -> Result<String> {
        let queries = &params.composite_query.builder_queries;
        let formula = queries
            .get(name)
            .ok_or_else(|| QuerierError::Compilation(format!("unknown formula {}", name)))?;
        let compiler = self.expressions.as_ref().ok_or_else(|| {
            QuerierError::Compilation("no expression compiler registered".to_string())
        })?;

        let mut sub_queries = BTreeMap::new();
        for variable in expression_variables(&formula.expression) {
            let query = queries.get(&variable).ok_or_else(|| {
                QuerierError::Compilation(format!(
                    "formula {} references unknown query {}",
                    name, variable
                ))
            })?;
            if query.is_expression() {
                return Err(QuerierError::Compilation(format!(
                    "formula {} references another formula {}",
                    name, variable
                )));
            }
            let compiled = self.compile(query, start, end, params.composite_query.panel_type)?;
            sub_queries.insert(variable, compiled);
        }

        if sub_queries.is_empty() {
            return Err(QuerierError::Compilation(format!(
                "formula {} does not reference any query",
                name
            )));
        }

        compiler.compile_expression(formula, &sub_queries)
    }
}

/// Identifiers of a formula that name queries, i.e. every identifier that
/// is not called as a function. Sorted and unique.
pub fn expression_variables(expression: &str) -> Vec<String> {
    let chars: Vec<char> = expression.chars().collect();
    let mut variables = BTreeSet::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() || c == '.' {
            // numeric literal, including exponents like 1e3
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let begin = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let ident: String = chars[begin..i].iter().collect();
            let mut j = i;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if chars.get(j) != Some(&'(') {
                variables.insert(ident);
            }
            continue;
        }
        i += 1;
    }
    variables.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttributeKey;

    struct EchoCompiler;

    impl QueryCompiler for EchoCompiler {
        fn compile(
            &self,
            query: &BuilderQuery,
            start: i64,
            end: i64,
            _panel_type: PanelType,
            options: &CompileOptions,
        ) -> Result<String> {
            Ok(match options.graph_limit {
                None => format!("series {} [{}, {}]", query.query_name, start, end),
                Some(GraphLimitPhase::GroupSelection) => {
                    format!("top {} {}", query.limit, query.query_name)
                }
                Some(GraphLimitPhase::Values) => {
                    format!("series {} in ({})", query.query_name, LIMIT_PLACEHOLDER)
                }
            })
        }
    }

    struct JoinCompiler;

    impl ExpressionCompiler for JoinCompiler {
        fn compile_expression(
            &self,
            formula: &BuilderQuery,
            sub_queries: &BTreeMap<String, String>,
        ) -> Result<String> {
            let parts: Vec<String> = sub_queries
                .iter()
                .map(|(k, v)| format!("{}: {}", k, v))
                .collect();
            Ok(format!("{} <- {}", formula.expression, parts.join("; ")))
        }
    }

    fn builder() -> QueryBuilder {
        QueryBuilder::new()
            .with_compiler(DataSource::Metrics, Arc::new(EchoCompiler))
            .with_expression_compiler(Arc::new(JoinCompiler))
    }

    #[test]
    fn test_expression_variables() {
        assert_eq!(expression_variables("A / B * 100"), vec!["A", "B"]);
        assert_eq!(expression_variables("abs(A - B) + A"), vec!["A", "B"]);
        assert_eq!(expression_variables("F1 + 1e3 + 2.5"), vec!["F1"]);
        assert!(expression_variables("42").is_empty());
    }

    #[test]
    fn test_compile_plain_query() {
        let query = BuilderQuery::new("A", DataSource::Metrics);
        let compiled = builder().compile(&query, 10, 20, PanelType::Graph).unwrap();
        assert_eq!(compiled, "series A [10, 20]");
    }

    #[test]
    fn test_compile_graph_limit_substitutes_group_selection() {
        let mut query = BuilderQuery::new("A", DataSource::Metrics);
        query.limit = 5;
        query.group_by = vec![AttributeKey::attribute("service")];

        let compiled = builder().compile(&query, 10, 20, PanelType::Graph).unwrap();
        assert_eq!(compiled, "series A in (top 5 A)");

        // table panels use a single query
        let compiled = builder().compile(&query, 10, 20, PanelType::Table).unwrap();
        assert_eq!(compiled, "series A [10, 20]");
    }

    #[test]
    fn test_missing_compiler_is_a_compilation_error() {
        let query = BuilderQuery::new("A", DataSource::Traces);
        let err = builder().compile(&query, 0, 1, PanelType::Graph).unwrap_err();
        assert!(matches!(err, QuerierError::Compilation(_)));
    }

    #[test]
    fn test_compile_expression() {
        let mut params = QueryRangeParams::default();
        let queries = &mut params.composite_query.builder_queries;
        queries.insert("A".into(), BuilderQuery::new("A", DataSource::Metrics));
        queries.insert("B".into(), BuilderQuery::new("B", DataSource::Metrics));
        let mut formula = BuilderQuery::new("F1", DataSource::Metrics);
        formula.expression = "A / B".into();
        queries.insert("F1".into(), formula);

        let compiled = builder().compile_expression("F1", &params, 0, 60).unwrap();
        assert_eq!(compiled, "A / B <- A: series A [0, 60]; B: series B [0, 60]");

        let mut broken = BuilderQuery::new("F2", DataSource::Metrics);
        broken.expression = "A / C".into();
        params
            .composite_query
            .builder_queries
            .insert("F2".into(), broken);
        assert!(builder().compile_expression("F2", &params, 0, 60).is_err());
    }
}
