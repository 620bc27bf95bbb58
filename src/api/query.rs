use super::AppState;
use crate::metrics::gather_text;
use crate::models::{PanelType, QueryRangeParams, QueryResult};
use crate::querier::RequestContext;
use crate::{QuerierError, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRangeData {
    pub result_type: PanelType,
    pub result: Vec<QueryResult>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRangeResponse {
    pub status: &'static str,
    pub data: QueryRangeData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub errors_by_query: BTreeMap<String, String>,
}

pub async fn query_range(
    State(state): State<AppState>,
    Json(params): Json<QueryRangeParams>,
) -> Result<impl IntoResponse> {
    params.validate()?;

    let mut ctx = RequestContext::new();
    if let Some(timeout) = state.timeout {
        ctx = ctx.with_timeout(timeout);
    }
    // In-flight units stop when the client goes away and this future is
    // dropped.
    let _cancel_on_drop = ctx.token().clone().drop_guard();

    info!(
        "Query range {} [{}, {}] {:?}",
        ctx.request_id(),
        params.start,
        params.end,
        params.composite_query.query_type
    );

    let output = state.querier.query_range(&ctx, &params).await;

    let status = output
        .error
        .as_ref()
        .map(QuerierError::status_code)
        .unwrap_or(StatusCode::OK);
    let response = QueryRangeResponse {
        status: if output.error.is_some() { "error" } else { "success" },
        data: QueryRangeData {
            result_type: params.composite_query.panel_type,
            result: output.results,
        },
        error: output.error.map(|e| e.to_string()),
        errors_by_query: output
            .errors_by_query
            .into_iter()
            .map(|(name, err)| (name, err.to_string()))
            .collect(),
    };

    Ok((status, Json(response)))
}

pub async fn metrics() -> Result<impl IntoResponse> {
    let body = gather_text()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
