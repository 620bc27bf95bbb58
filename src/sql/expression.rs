use super::quote_ident;
use crate::compile::ExpressionCompiler;
use crate::models::BuilderQuery;
use crate::{QuerierError, Result};
use std::collections::BTreeMap;

/// Evaluates formulas by joining the referenced series queries on
/// `(labels, bucket)`.
///
/// Rows where the formula is undefined (for example a division by zero)
/// are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlExpressionCompiler;

impl ExpressionCompiler for SqlExpressionCompiler {
    fn compile_expression(
        &self,
        formula: &BuilderQuery,
        sub_queries: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut names = sub_queries.keys();
        let first = names.next().ok_or_else(|| {
            QuerierError::Compilation(format!(
                "formula {} has no sub-queries",
                formula.query_name
            ))
        })?;
        let first_alias = quote_ident(first)?;

        let mut from = format!("({}) AS {}", sub_queries[first], first_alias);
        for name in names {
            let alias = quote_ident(name)?;
            from.push_str(&format!(
                " INNER JOIN ({sql}) AS {alias} ON {first}.labels = {alias}.labels AND {first}.bucket = {alias}.bucket",
                sql = sub_queries[name],
                alias = alias,
                first = first_alias,
            ));
        }

        let value = rewrite_formula(&formula.expression, sub_queries)?;
        Ok(format!(
            "SELECT labels, bucket, value FROM (\
             SELECT {first}.labels AS labels, {first}.bucket AS bucket, CAST(({value}) AS DOUBLE) AS value FROM {from}\
             ) WHERE value IS NOT NULL AND isfinite(value) ORDER BY 1, 2",
            first = first_alias,
            value = value,
            from = from,
        ))
    }
}

/// Replace query names in `expression` with the joined `value` columns.
fn rewrite_formula(expression: &str, sub_queries: &BTreeMap<String, String>) -> Result<String> {
    let chars: Vec<char> = expression.chars().collect();
    let mut out = String::with_capacity(expression.len() + 16);
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() || c == '.' {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                out.push(chars[i]);
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
            if sub_queries.contains_key(&ident) {
                out.push_str(&format!("{}.value", quote_ident(&ident)?));
            } else {
                out.push_str(&ident);
            }
            continue;
        }
        if c == ';' || c == '\'' || c == '"' {
            return Err(QuerierError::Compilation(format!(
                "unexpected {:?} in formula {}",
                c, expression
            )));
        }
        out.push(c);
        i += 1;
    }
    Ok(out)
}
