pub mod api;
pub mod cache;
pub mod compile;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod querier;
pub mod reader;
pub mod sql;

pub use error::{
    is_resource_limit_error, QuerierError, ResourceLimitError, ResourceLimitKind, Result,
};
pub use querier::{Querier, QuerierOptions, QueryRangeOutput, RequestContext};
