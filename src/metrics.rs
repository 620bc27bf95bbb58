use crate::{QuerierError, Result};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Encoder, Histogram,
    IntCounter, IntCounterVec, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    // Request metrics
    pub static ref QUERY_RANGE_REQUESTS: IntCounter = register_int_counter!(
        "querier_query_range_requests_total",
        "Total number of query range requests"
    ).unwrap();

    pub static ref QUERY_RANGE_DURATION: Histogram = register_histogram!(
        "querier_query_range_duration_seconds",
        "Query range latency in seconds",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 15.0, 30.0]
    ).unwrap();

    // Unit metrics
    pub static ref UNITS_EXECUTED: IntCounterVec = register_int_counter_vec!(
        "querier_units_total",
        "Query units dispatched, by kind",
        &["kind"]
    ).unwrap();

    pub static ref UNIT_FAILURES: IntCounterVec = register_int_counter_vec!(
        "querier_unit_failures_total",
        "Query units that failed, by kind",
        &["kind"]
    ).unwrap();

    pub static ref QUERIES_EXECUTED: IntCounter = register_int_counter!(
        "querier_queries_executed_total",
        "Compiled queries sent to the store"
    ).unwrap();

    // Cache metrics
    pub static ref CACHE_LOOKUPS: IntCounterVec = register_int_counter_vec!(
        "querier_cache_lookups_total",
        "Time range cache lookups, by outcome (hit, partial, miss)",
        &["outcome"]
    ).unwrap();

    pub static ref CACHE_MISS_INTERVALS: IntCounter = register_int_counter!(
        "querier_cache_miss_intervals_total",
        "Missing intervals fetched from the store"
    ).unwrap();
}

/// Counts a query range request and observes its latency on drop.
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    pub fn new() -> Self {
        QUERY_RANGE_REQUESTS.inc();
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for RequestTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        QUERY_RANGE_DURATION.observe(duration);
    }
}

pub fn record_cache_lookup(outcome: &str) {
    CACHE_LOOKUPS.with_label_values(&[outcome]).inc();
}

pub fn record_miss_intervals(count: usize) {
    CACHE_MISS_INTERVALS.inc_by(count as u64);
}

pub fn record_unit(kind: &str) {
    UNITS_EXECUTED.with_label_values(&[kind]).inc();
}

pub fn record_unit_failure(kind: &str) {
    UNIT_FAILURES.with_label_values(&[kind]).inc();
}

pub fn record_query_executed() {
    QUERIES_EXECUTED.inc();
}

/// Everything in the default registry, in the Prometheus text format.
pub fn gather_text() -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| QuerierError::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| QuerierError::Internal(format!("Metrics are not valid UTF-8: {}", e)))
}
