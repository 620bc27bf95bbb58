use crate::compile::{expression_variables, QueryBuilder};
use crate::models::{BuilderQuery, PanelType, QueryRangeParams, QueryType};
use std::collections::HashMap;

/// Derives one cache key per cacheable query of a request.
///
/// Keys describe the shape of a query and never its time window, so the
/// same query over different windows shares cached intervals. Queries left
/// out of the returned map are not cached.
pub trait CacheKeyGenerator: Send + Sync {
    fn generate_keys(&self, params: &QueryRangeParams) -> HashMap<String, String>;
}

/// Default key generator: graph-panel builder queries and PromQL queries.
/// Graph queries limited to the top N groups, and formulas over them, get
/// no key.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShapeKeyGenerator;

impl ShapeKeyGenerator {
    fn builder_query_key(query: &BuilderQuery) -> String {
        let filters = serde_json::to_string(&query.filters).unwrap_or_default();
        let group_by = serde_json::to_string(&query.group_by).unwrap_or_default();
        let order_by = serde_json::to_string(&query.order_by).unwrap_or_default();
        let attribute = serde_json::to_string(&query.aggregate_attribute).unwrap_or_default();
        format!(
            "source={}&step={}&aggregate={}&attribute={}&filter={}&group_by={}&order_by={}&limit={}",
            query.data_source.as_str(),
            query.step_interval,
            query.aggregate_operator.as_str(),
            attribute,
            filters,
            group_by,
            order_by,
            query.limit,
        )
    }
}

impl CacheKeyGenerator for ShapeKeyGenerator {
    fn generate_keys(&self, params: &QueryRangeParams) -> HashMap<String, String> {
        let composite = &params.composite_query;
        let mut keys = HashMap::new();

        match composite.query_type {
            QueryType::Builder if composite.panel_type == PanelType::Graph => {
                for (name, query) in &composite.builder_queries {
                    // Top-N groups depend on the whole window.
                    if !query.is_expression()
                        && !QueryBuilder::needs_graph_limit(query, composite.panel_type)
                    {
                        keys.insert(name.clone(), Self::builder_query_key(query));
                    }
                }

                for (name, query) in &composite.builder_queries {
                    if !query.is_expression() {
                        continue;
                    }
                    let mut parts = vec![format!("expression={}", query.expression)];
                    let mut cacheable = true;
                    for variable in expression_variables(&query.expression) {
                        match keys.get(&variable) {
                            Some(key) => parts.push(format!("{}={}", variable, key)),
                            None => cacheable = false,
                        }
                    }
                    if cacheable {
                        keys.insert(name.clone(), parts.join("&"));
                    }
                }
            }
            QueryType::PromQl => {
                for (name, query) in &composite.prom_queries {
                    keys.insert(
                        name.clone(),
                        format!("prom={}&step={}", query.query, params.step),
                    );
                }
            }
            _ => {}
        }

        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttributeKey, CompositeQuery, DataSource, PromQuery};

    fn params(panel_type: PanelType, start: i64, end: i64) -> QueryRangeParams {
        let mut a = BuilderQuery::new("A", DataSource::Metrics);
        a.aggregate_attribute = AttributeKey::attribute("http_requests_total");
        let mut b = BuilderQuery::new("B", DataSource::Metrics);
        b.aggregate_attribute = AttributeKey::attribute("http_errors_total");
        let mut f1 = BuilderQuery::new("F1", DataSource::Metrics);
        f1.expression = "B / A".to_string();

        QueryRangeParams {
            start,
            end,
            step: 60,
            composite_query: CompositeQuery {
                panel_type,
                builder_queries: [("A", a), ("B", b), ("F1", f1)]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                ..Default::default()
            },
            no_cache: false,
        }
    }

    #[test]
    fn test_keys_ignore_time_window() {
        let generator = ShapeKeyGenerator;
        let first = generator.generate_keys(&params(PanelType::Graph, 0, 1000));
        let second = generator.generate_keys(&params(PanelType::Graph, 5000, 9000));
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert_ne!(first["A"], first["B"]);
        assert!(first["F1"].contains(&first["A"]));
        assert!(first["F1"].contains(&first["B"]));
    }

    #[test]
    fn test_keys_ignore_shift() {
        let generator = ShapeKeyGenerator;
        let plain = generator.generate_keys(&params(PanelType::Graph, 0, 1000));
        let mut shifted = params(PanelType::Graph, 0, 1000);
        shifted
            .composite_query
            .builder_queries
            .get_mut("A")
            .unwrap()
            .shift_by = 86_400;
        assert_eq!(plain["A"], generator.generate_keys(&shifted)["A"]);
    }

    #[test]
    fn test_non_graph_panels_are_not_cached() {
        let generator = ShapeKeyGenerator;
        assert!(generator
            .generate_keys(&params(PanelType::Table, 0, 1000))
            .is_empty());
        assert!(generator
            .generate_keys(&params(PanelType::List, 0, 1000))
            .is_empty());
    }

    #[test]
    fn test_prom_keys_include_step() {
        let generator = ShapeKeyGenerator;
        let mut p = params(PanelType::Graph, 0, 1000);
        p.composite_query.query_type = QueryType::PromQl;
        p.composite_query.prom_queries.insert(
            "A".to_string(),
            PromQuery {
                query: "rate(http_requests_total[5m])".to_string(),
                disabled: false,
            },
        );
        let keys = generator.generate_keys(&p);
        p.step = 120;
        assert_ne!(keys["A"], generator.generate_keys(&p)["A"]);
    }

    #[test]
    fn test_top_n_graph_queries_are_not_cached() {
        let generator = ShapeKeyGenerator;
        let mut p = params(PanelType::Graph, 0, 1000);
        let a = p.composite_query.builder_queries.get_mut("A").unwrap();
        a.group_by = vec![AttributeKey::attribute("service")];
        a.limit = 5;

        let keys = generator.generate_keys(&p);
        assert!(!keys.contains_key("A"));
        assert!(keys.contains_key("B"));
        // F1 reads A, so it cannot be cached either.
        assert!(!keys.contains_key("F1"));
    }
}
