use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Which budget a query ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLimitKind {
    /// The query would scan more bytes than allowed.
    Bytes,
    /// The query ran longer than allowed.
    Time,
    /// The query produced more rows than allowed.
    Rows,
}

impl fmt::Display for ResourceLimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceLimitKind::Bytes => write!(f, "scan size"),
            ResourceLimitKind::Time => write!(f, "execution time"),
            ResourceLimitKind::Rows => write!(f, "result rows"),
        }
    }
}

/// Marker error for queries that exceed a configured budget.
///
/// This is the only execution failure that is shown to users of builder
/// queries, because they can act on it by narrowing the query.
#[derive(Debug, Clone, Error)]
#[error("{kind} limit exceeded: {message}. Narrow your filters or shorten the time range")]
pub struct ResourceLimitError {
    pub kind: ResourceLimitKind,
    pub message: String,
}

impl ResourceLimitError {
    pub fn new(kind: ResourceLimitKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum QuerierError {
    #[error("{0}")]
    ResourceLimit(#[from] ResourceLimitError),

    #[error("Compilation error: {0}")]
    Compilation(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Query deadline exceeded")]
    DeadlineExceeded,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("error in query-{name}: {source}")]
    Unit {
        name: String,
        #[source]
        source: Box<QuerierError>,
    },
}

impl QuerierError {
    /// Attach the name of the query that produced this error.
    pub fn in_query(self, name: impl Into<String>) -> Self {
        QuerierError::Unit {
            name: name.into(),
            source: Box::new(self),
        }
    }

    pub fn is_resource_limit(&self) -> bool {
        is_resource_limit_error(self)
    }

    /// The error without any query-name wrapping.
    pub fn root_cause(&self) -> &QuerierError {
        match self {
            QuerierError::Unit { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            QuerierError::Validation(_)
            | QuerierError::Compilation(_)
            | QuerierError::Serialization(_) => StatusCode::BAD_REQUEST,
            QuerierError::ResourceLimit(_) => StatusCode::UNPROCESSABLE_ENTITY,
            QuerierError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            QuerierError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            QuerierError::Unit { source, .. } => source.status_code(),
            QuerierError::Execution(_)
            | QuerierError::Database(_)
            | QuerierError::Config(_)
            | QuerierError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Reports whether `err`, or anything in its source chain, is a
/// [`ResourceLimitError`].
pub fn is_resource_limit_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if e.downcast_ref::<ResourceLimitError>().is_some() {
            return true;
        }
        if let Some(QuerierError::ResourceLimit(_)) = e.downcast_ref::<QuerierError>() {
            return true;
        }
        current = e.source();
    }
    false
}

impl From<duckdb::Error> for QuerierError {
    fn from(err: duckdb::Error) -> Self {
        QuerierError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for QuerierError {
    fn from(err: serde_json::Error) -> Self {
        QuerierError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for QuerierError {
    fn from(err: toml::de::Error) -> Self {
        QuerierError::Config(err.to_string())
    }
}

impl IntoResponse for QuerierError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "status": "error",
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, QuerierError>;
