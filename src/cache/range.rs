//! Time-range result cache.
//!
//! For every query shape (cache key) the cache keeps a list of closed
//! intervals `[start, end]` (milliseconds) whose results are fully known,
//! together with the series observed inside them. The querier asks for the
//! sub-ranges of a request that are not covered, fetches only those, and
//! merges them back; the persisted list is coalesced on every merge so no
//! two stored intervals overlap or touch.
//!
//! Boundary convention: intervals are closed and a miss shares its boundary
//! timestamps with the cached intervals around it. Cached `[1000, 2000]`
//! inside a request `[0, 3000]` yields misses `[0, 1000]` and `[2000, 3000]`.

use super::ByteCache;
use crate::metrics;
use crate::models::{Point, Series};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A closed interval with fully known results for the series it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSeriesData {
    pub start: i64,
    pub end: i64,
    #[serde(default)]
    pub data: Vec<Series>,
}

impl CachedSeriesData {
    /// Build an interval from freshly fetched series, dropping points that
    /// fall outside `[start, end]`.
    pub fn from_window(start: i64, end: i64, mut data: Vec<Series>) -> Self {
        for series in &mut data {
            series
                .points
                .retain(|p| p.timestamp >= start && p.timestamp <= end);
        }
        Self { start, end, data }
    }
}

/// A sub-range of a request with no usable cached data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissInterval {
    pub start: i64,
    pub end: i64,
}

impl MissInterval {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }
}

/// How fetched series are trimmed before they are cached.
///
/// Aggregation buckets cut by a miss window hold partial values; caching
/// them would serve those partial values to later requests. Metrics and
/// formulas always use [`AggregationWindow`](Self::AggregationWindow); logs
/// follow the configured policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryTruncation {
    /// Cache series exactly as fetched.
    Disabled,
    /// Drop the partial buckets at either edge of the miss window and
    /// shrink the cached interval to whole steps.
    #[default]
    AggregationWindow,
}

impl BoundaryTruncation {
    /// Returns the series to cache and the interval bounds they are valid
    /// for. `step` is in seconds.
    pub fn filter_series_points(
        &self,
        series: &[Series],
        miss_start: i64,
        miss_end: i64,
        step: i64,
    ) -> (Vec<Series>, i64, i64) {
        let step_ms = match step.checked_mul(1000) {
            Some(step_ms) if step_ms > 0 && *self != BoundaryTruncation::Disabled => step_ms,
            _ => return (series.to_vec(), miss_start, miss_end),
        };

        // Shorter than one bucket: nothing complete to cache.
        if miss_start + step_ms > miss_end {
            return (Vec::new(), miss_start, miss_end);
        }

        let end_aligned = miss_end % step_ms == 0;
        let last_bucket = miss_end - miss_end % step_ms;
        let end = last_bucket;
        let start = if miss_start % step_ms != 0 {
            miss_start + step_ms - miss_start % step_ms
        } else {
            miss_start
        };

        let mut filtered = Vec::with_capacity(series.len());
        for s in series {
            if s.points.is_empty() {
                filtered.push(Series::new(s.labels.clone(), Vec::new()));
                continue;
            }

            let mut points = s.points.clone();
            points.sort_by_key(|p| p.timestamp);

            if points.first().map(|p| p.timestamp < miss_start).unwrap_or(false) {
                points.remove(0);
            }

            let trailing_partial = points
                .last()
                .map(|p| {
                    (!end_aligned && p.timestamp == last_bucket)
                        || (end_aligned && p.timestamp == miss_end)
                })
                .unwrap_or(false);
            if trailing_partial {
                points.pop();
            }

            if !points.is_empty() {
                filtered.push(Series::new(s.labels.clone(), points));
            }
        }

        (filtered, start, end)
    }
}

/// Interval bookkeeping and series merging over a [`ByteCache`].
#[derive(Clone)]
pub struct TimeRangeCache {
    cache: Option<Arc<dyn ByteCache>>,
    flux_interval: Duration,
    ttl: Duration,
}

impl TimeRangeCache {
    pub fn new(cache: Option<Arc<dyn ByteCache>>, flux_interval: Duration) -> Self {
        Self {
            cache,
            flux_interval,
            ttl: Duration::from_secs(3600),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn flux_interval(&self) -> Duration {
        self.flux_interval
    }

    /// Returns the sub-ranges of `[start, end]` (ms) not covered by cached
    /// data for `cache_key`, ascending and non-overlapping. `step` is in
    /// seconds.
    pub async fn find_missing_time_ranges(
        &self,
        start: i64,
        end: i64,
        step: i64,
        cache_key: &str,
    ) -> Vec<MissInterval> {
        let now_ms = Utc::now().timestamp_millis();
        self.find_missing_time_ranges_at(now_ms, start, end, step, cache_key)
            .await
    }

    /// Same as [`find_missing_time_ranges`](Self::find_missing_time_ranges)
    /// with an explicit wall clock.
    pub async fn find_missing_time_ranges_at(
        &self,
        now_ms: i64,
        start: i64,
        end: i64,
        step: i64,
        cache_key: &str,
    ) -> Vec<MissInterval> {
        if cache_key.is_empty() || self.cache.is_none() {
            return vec![MissInterval::new(start, end)];
        }

        let cached = self.load(cache_key).await;
        let misses = find_missing_in(
            &cached,
            start,
            end,
            step,
            self.flux_interval,
            now_ms,
        );

        let outcome = if misses.is_empty() {
            "hit"
        } else if misses.len() == 1 && misses[0] == MissInterval::new(start, end) {
            "miss"
        } else {
            "partial"
        };
        metrics::record_cache_lookup(outcome);
        debug!(cache_key, start, end, outcome, misses = misses.len(), "cache lookup");

        misses
    }

    /// Merge `new_data` into the intervals stored under `cache_key`,
    /// persist the coalesced list and return it.
    pub async fn merge_with_cached_series_data(
        &self,
        cache_key: &str,
        new_data: Vec<CachedSeriesData>,
    ) -> Vec<CachedSeriesData> {
        let merged = self.merge_without_store(cache_key, new_data).await;
        self.store_series(cache_key, &merged).await;
        merged
    }

    /// Merge `new_data` with the stored intervals without persisting.
    pub async fn merge_without_store(
        &self,
        cache_key: &str,
        new_data: Vec<CachedSeriesData>,
    ) -> Vec<CachedSeriesData> {
        let mut all = if cache_key.is_empty() {
            Vec::new()
        } else {
            self.load(cache_key).await
        };
        all.extend(new_data);
        merge_intervals(all)
    }

    /// Replace the stored intervals for `cache_key`. Failures are logged;
    /// a lost write only costs a future cache miss.
    pub async fn store_series(&self, cache_key: &str, data: &[CachedSeriesData]) {
        let Some(cache) = &self.cache else {
            return;
        };
        if cache_key.is_empty() {
            return;
        }

        let payload = match serde_json::to_vec(data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(cache_key, error = %e, "failed to serialize cached series");
                return;
            }
        };
        if let Err(e) = cache.store(cache_key, Bytes::from(payload), self.ttl).await {
            warn!(cache_key, error = %e, "failed to store cached series");
        }
    }

    async fn load(&self, cache_key: &str) -> Vec<CachedSeriesData> {
        let Some(cache) = &self.cache else {
            return Vec::new();
        };
        let Some(payload) = cache.retrieve(cache_key).await else {
            return Vec::new();
        };
        if payload.is_empty() {
            return Vec::new();
        }
        match serde_json::from_slice::<Vec<CachedSeriesData>>(&payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(cache_key, error = %e, "discarding unreadable cache payload");
                Vec::new()
            }
        }
    }
}

/// Interval walk behind [`TimeRangeCache::find_missing_time_ranges`].
pub fn find_missing_in(
    cached: &[CachedSeriesData],
    start: i64,
    end: i64,
    step: i64,
    flux_interval: Duration,
    now_ms: i64,
) -> Vec<MissInterval> {
    let mut bounds: Vec<(i64, i64)> = cached.iter().map(|c| (c.start, c.end)).collect();
    bounds.sort_by_key(|&(s, _)| s);

    // Data close to now may still be arriving, never treat it as cached.
    let adjust_step = step.clamp(1, 60);
    let rounded_now = now_ms - now_ms % (adjust_step * 1000);
    let flux_ms = flux_interval.as_millis() as i64;
    if let Some(last) = bounds.last_mut() {
        last.1 = last.1.min(rounded_now - flux_ms);
    }

    let mut misses = Vec::new();
    let mut cursor = start;
    for (interval_start, interval_end) in bounds {
        if interval_end <= cursor || interval_start >= end {
            continue;
        }
        if cursor < interval_start {
            misses.push(MissInterval::new(cursor, interval_start.min(end)));
        }
        cursor = cursor.max(interval_end.min(end));
    }
    if cursor < end {
        misses.push(MissInterval::new(cursor, end));
    }
    misses
}

/// Sort and coalesce intervals; overlapping or touching intervals are
/// combined and their series merged.
pub fn merge_intervals(mut intervals: Vec<CachedSeriesData>) -> Vec<CachedSeriesData> {
    intervals.sort_by_key(|i| i.start);

    let mut merged = Vec::with_capacity(intervals.len());
    let mut iter = intervals.into_iter();
    let Some(mut current) = iter.next() else {
        return merged;
    };

    for interval in iter {
        if interval.start <= current.end {
            current.start = current.start.min(interval.start);
            current.end = current.end.max(interval.end);
            current.data = merge_series(std::mem::take(&mut current.data), interval.data);
        } else {
            let done = std::mem::replace(&mut current, interval);
            merged.push(normalized(done));
        }
    }
    merged.push(normalized(current));
    merged
}

fn normalized(mut interval: CachedSeriesData) -> CachedSeriesData {
    interval.data = merge_series(std::mem::take(&mut interval.data), Vec::new());
    interval
}

/// Merge two series sets by label set. Points of matching series are
/// appended, sorted and de-duplicated (later points win). Output is ordered
/// by labels.
pub fn merge_series(current: Vec<Series>, incoming: Vec<Series>) -> Vec<Series> {
    let mut by_labels: BTreeMap<BTreeMap<String, String>, Vec<Point>> = BTreeMap::new();
    for series in current.into_iter().chain(incoming) {
        by_labels
            .entry(series.labels)
            .or_default()
            .extend(series.points);
    }

    by_labels
        .into_iter()
        .map(|(labels, points)| finished(Series::new(labels, points)))
        .collect()
}

/// Stitch the points inside `[start, end]` out of cached intervals into one
/// series per label set. Series without points in the window are dropped.
pub fn series_from_cached_data(data: &[CachedSeriesData], start: i64, end: i64) -> Vec<Series> {
    let mut by_labels: BTreeMap<&BTreeMap<String, String>, Vec<Point>> = BTreeMap::new();
    for interval in data {
        if interval.end < start || interval.start > end {
            continue;
        }
        for series in &interval.data {
            let points = series
                .points
                .iter()
                .filter(|p| p.timestamp >= start && p.timestamp <= end)
                .copied();
            by_labels.entry(&series.labels).or_default().extend(points);
        }
    }

    by_labels
        .into_iter()
        .filter(|(_, points)| !points.is_empty())
        .map(|(labels, points)| finished(Series::new(labels.clone(), points)))
        .collect()
}

fn finished(mut series: Series) -> Series {
    series.sort_points();
    series.remove_duplicate_points();
    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryByteCache;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn interval(start: i64, end: i64) -> CachedSeriesData {
        CachedSeriesData {
            start,
            end,
            data: Vec::new(),
        }
    }

    fn miss(start: i64, end: i64) -> MissInterval {
        MissInterval::new(start, end)
    }

    fn cache_without_flux() -> (Arc<InMemoryByteCache>, TimeRangeCache) {
        let bytes = Arc::new(InMemoryByteCache::default());
        let cache = TimeRangeCache::new(Some(bytes.clone()), Duration::ZERO);
        (bytes, cache)
    }

    async fn seed(bytes: &InMemoryByteCache, key: &str, data: &[CachedSeriesData]) {
        bytes
            .store(key, Bytes::from(serde_json::to_vec(data).unwrap()), Duration::ZERO)
            .await
            .unwrap();
    }

    // Far in the future relative to every fixture, so the flux clamp never
    // bites unless a test asks for it.
    const NOW: i64 = 4_000_000_000_000;

    #[tokio::test]
    async fn test_find_missing_time_ranges_cases() {
        let cases: Vec<(&str, i64, i64, Vec<CachedSeriesData>, Vec<MissInterval>)> = vec![
            (
                "cached range inside request",
                1000,
                5000,
                vec![interval(2000, 3000)],
                vec![miss(1000, 2000), miss(3000, 5000)],
            ),
            (
                "cached range covers request",
                2000,
                3000,
                vec![interval(1000, 4000)],
                vec![],
            ),
            (
                "cached range overlaps request start",
                2000,
                4000,
                vec![interval(1000, 2500)],
                vec![miss(2500, 4000)],
            ),
            (
                "cached range overlaps request end",
                2000,
                4000,
                vec![interval(3500, 5000)],
                vec![miss(2000, 3500)],
            ),
            (
                "cached range disjoint from request",
                2000,
                4000,
                vec![interval(5000, 6000)],
                vec![miss(2000, 4000)],
            ),
            (
                "several cached ranges inside request",
                1000,
                5000,
                vec![interval(1100, 1200), interval(1300, 1400), interval(1500, 1600)],
                vec![
                    miss(1000, 1100),
                    miss(1200, 1300),
                    miss(1400, 1500),
                    miss(1600, 5000),
                ],
            ),
            (
                "cached ranges touching request start",
                1000,
                2000,
                vec![
                    interval(1000, 1100),
                    interval(1200, 1300),
                    interval(1400, 1500),
                    interval(1600, 1700),
                ],
                vec![
                    miss(1100, 1200),
                    miss(1300, 1400),
                    miss(1500, 1600),
                    miss(1700, 2000),
                ],
            ),
            (
                "cached ranges outside request",
                2000,
                3000,
                vec![interval(1000, 1500), interval(3500, 4000)],
                vec![miss(2000, 3000)],
            ),
            ("nothing cached", 1000, 2000, vec![], vec![miss(1000, 2000)]),
            (
                "overlapping cached ranges",
                1000,
                5000,
                vec![
                    interval(1000, 2000),
                    interval(1500, 2500),
                    interval(3000, 3500),
                    interval(4000, 4500),
                ],
                vec![miss(2500, 3000), miss(3500, 4000), miss(4500, 5000)],
            ),
            (
                "cached edges with a hole",
                1000,
                5000,
                vec![interval(1000, 1500), interval(4500, 5000)],
                vec![miss(1500, 4500)],
            ),
            (
                "unsorted cached ranges",
                1000,
                2000,
                vec![interval(1800, 1900), interval(1100, 1200)],
                vec![miss(1000, 1100), miss(1200, 1800), miss(1900, 2000)],
            ),
        ];

        let (bytes, cache) = cache_without_flux();
        for (i, (name, start, end, cached, expected)) in cases.into_iter().enumerate() {
            let key = format!("case-{}", i);
            if !cached.is_empty() {
                seed(&bytes, &key, &cached).await;
            }
            let misses = cache
                .find_missing_time_ranges_at(NOW, start, end, 60, &key)
                .await;
            assert_eq!(misses, expected, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_empty_key_or_missing_store_is_full_miss() {
        let (_, cache) = cache_without_flux();
        assert_eq!(
            cache.find_missing_time_ranges_at(NOW, 10, 20, 60, "").await,
            vec![miss(10, 20)]
        );

        let disabled = TimeRangeCache::new(None, Duration::ZERO);
        assert!(!disabled.is_enabled());
        assert_eq!(
            disabled.find_missing_time_ranges_at(NOW, 10, 20, 60, "k").await,
            vec![miss(10, 20)]
        );
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_treated_as_empty() {
        let (bytes, cache) = cache_without_flux();
        bytes
            .store("k", Bytes::from_static(b"{not json"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(
            cache.find_missing_time_ranges_at(NOW, 1000, 2000, 60, "k").await,
            vec![miss(1000, 2000)]
        );

        let merged = cache
            .merge_with_cached_series_data("k", vec![interval(1000, 1500)])
            .await;
        assert_eq!(merged, vec![interval(1000, 1500)]);
    }

    #[tokio::test]
    async fn test_flux_interval_excludes_recent_data() {
        let bytes = Arc::new(InMemoryByteCache::default());
        let cache = TimeRangeCache::new(Some(bytes.clone()), Duration::from_secs(300));

        let now = 1_700_000_000_000;
        let start = now - 3_600_000;
        seed(&bytes, "k", &[interval(start, now)]).await;

        let misses = cache.find_missing_time_ranges_at(now, start, now, 60, "k").await;
        let rounded_now = now - now % 60_000;
        assert_eq!(misses, vec![miss(rounded_now - 300_000, now)]);
    }

    #[tokio::test]
    async fn test_flux_interval_uses_wall_clock() {
        let bytes = Arc::new(InMemoryByteCache::default());
        let cache = TimeRangeCache::new(Some(bytes.clone()), Duration::from_secs(300));

        let now = Utc::now().timestamp_millis();
        let start = now - 3_600_000;
        seed(&bytes, "k", &[interval(start, now)]).await;

        let misses = cache.find_missing_time_ranges(start, now, 60, "k").await;
        let after = Utc::now().timestamp_millis();
        assert_eq!(misses.len(), 1);
        assert!(misses[0].start <= after - 300_000);
        assert!(misses[0].start > now - 300_000 - 60_000);
        assert_eq!(misses[0].end, now);
    }

    #[tokio::test]
    async fn test_merge_with_cached_series_data() {
        let (bytes, cache) = cache_without_flux();
        let cpu = labels(&[("metric", "cpu"), ("instance", "localhost")]);
        let memory = labels(&[("metric", "memory"), ("instance", "localhost")]);

        seed(
            &bytes,
            "merge",
            &[CachedSeriesData {
                start: 1000,
                end: 2000,
                data: vec![Series::new(cpu.clone(), vec![Point::new(1500, 0.5)])],
            }],
        )
        .await;

        let merged = cache
            .merge_with_cached_series_data(
                "merge",
                vec![CachedSeriesData {
                    start: 1500,
                    end: 2500,
                    data: vec![
                        Series::new(cpu.clone(), vec![Point::new(1750, 0.6)]),
                        Series::new(memory.clone(), vec![Point::new(1800, 0.7)]),
                    ],
                }],
            )
            .await;

        assert_eq!(merged.len(), 1);
        assert_eq!((merged[0].start, merged[0].end), (1000, 2500));
        let cpu_series = merged[0].data.iter().find(|s| s.labels == cpu).unwrap();
        assert_eq!(
            cpu_series.points,
            vec![Point::new(1500, 0.5), Point::new(1750, 0.6)]
        );
        let memory_series = merged[0].data.iter().find(|s| s.labels == memory).unwrap();
        assert_eq!(memory_series.points, vec![Point::new(1800, 0.7)]);

        // persisted
        let stored: Vec<CachedSeriesData> =
            serde_json::from_slice(&bytes.retrieve("merge").await.unwrap()).unwrap();
        assert_eq!(stored, merged);
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let (_, cache) = cache_without_flux();
        let data = CachedSeriesData {
            start: 1000,
            end: 5000,
            data: vec![
                Series::new(
                    labels(&[("host", "b")]),
                    vec![Point::new(3000, 2.0), Point::new(1000, 1.0)],
                ),
                Series::new(labels(&[("host", "a")]), vec![Point::new(2000, 4.0)]),
            ],
        };

        let once = cache
            .merge_with_cached_series_data("idem", vec![data.clone()])
            .await;
        let twice = cache.merge_with_cached_series_data("idem", vec![data]).await;
        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
        for series in &twice[0].data {
            let mut timestamps: Vec<i64> = series.points.iter().map(|p| p.timestamp).collect();
            let before = timestamps.len();
            timestamps.dedup();
            assert_eq!(before, timestamps.len());
        }
    }

    #[tokio::test]
    async fn test_disjoint_intervals_stay_separate() {
        let (_, cache) = cache_without_flux();
        let merged = cache
            .merge_with_cached_series_data(
                "disjoint",
                vec![interval(3000, 4000), interval(1000, 2000)],
            )
            .await;
        assert_eq!(merged, vec![interval(1000, 2000), interval(3000, 4000)]);

        // touching intervals coalesce
        let merged = cache
            .merge_with_cached_series_data("disjoint", vec![interval(2000, 3000)])
            .await;
        assert_eq!(merged, vec![interval(1000, 4000)]);
    }

    #[tokio::test]
    async fn test_merge_then_find_is_a_full_hit() {
        let (_, cache) = cache_without_flux();
        cache
            .merge_with_cached_series_data("rt", vec![interval(1000, 61_000)])
            .await;
        assert!(cache
            .find_missing_time_ranges_at(NOW, 1000, 61_000, 60, "rt")
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_partial_fetch_then_repeat_request() {
        let (_, cache) = cache_without_flux();
        let misses = cache
            .find_missing_time_ranges_at(NOW, 1000, 181_000, 60, "scenario")
            .await;
        assert_eq!(misses, vec![miss(1000, 181_000)]);

        cache
            .merge_with_cached_series_data("scenario", vec![interval(1000, 61_000)])
            .await;
        let misses = cache
            .find_missing_time_ranges_at(NOW, 1000, 181_000, 60, "scenario")
            .await;
        assert_eq!(misses, vec![miss(61_000, 181_000)]);
    }

    #[test]
    fn test_misses_and_cache_cover_request_exactly() {
        let cached = vec![
            interval(1100, 1200),
            interval(1150, 1250),
            interval(1400, 1700),
            interval(1900, 2600),
        ];
        let windows = [(1000, 2000), (1120, 1300), (1250, 1400), (500, 900), (1400, 1700)];
        for (start, end) in windows {
            let misses = find_missing_in(&cached, start, end, 60, Duration::ZERO, NOW);

            for pair in misses.windows(2) {
                assert!(pair[0].end <= pair[1].start, "misses overlap: {:?}", misses);
            }
            for ms in start..end {
                let in_miss = misses.iter().any(|m| ms >= m.start && ms < m.end);
                let in_cache = cached.iter().any(|c| ms >= c.start && ms < c.end);
                assert!(
                    in_miss ^ in_cache,
                    "ms {} of [{}, {}] covered {} times",
                    ms,
                    start,
                    end,
                    in_miss as u8 + in_cache as u8
                );
            }
        }
    }

    #[test]
    fn test_series_from_cached_data_stitches_intervals() {
        let a = labels(&[("service", "api")]);
        let data = vec![
            CachedSeriesData {
                start: 0,
                end: 100,
                data: vec![Series::new(
                    a.clone(),
                    vec![Point::new(0, 1.0), Point::new(50, 2.0), Point::new(100, 3.0)],
                )],
            },
            CachedSeriesData {
                start: 200,
                end: 300,
                data: vec![
                    Series::new(a.clone(), vec![Point::new(200, 4.0), Point::new(300, 5.0)]),
                    Series::new(labels(&[("service", "db")]), vec![Point::new(290, 9.0)]),
                ],
            },
        ];

        let series = series_from_cached_data(&data, 50, 250);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].labels, a);
        assert_eq!(
            series[0].points,
            vec![Point::new(50, 2.0), Point::new(100, 3.0), Point::new(200, 4.0)]
        );
    }

    #[test]
    fn test_merge_series_keys_on_exact_labels() {
        let merged = merge_series(
            vec![
                Series::new(labels(&[("ab", "c")]), vec![Point::new(1, 1.0)]),
                Series::new(labels(&[("a", "bc")]), vec![Point::new(1, 2.0)]),
            ],
            vec![
                Series::new(BTreeMap::new(), vec![Point::new(1, 3.0)]),
                Series::new(labels(&[("a", "bc")]), vec![Point::new(2, 4.0)]),
            ],
        );

        let label_sets: Vec<_> = merged.iter().map(|s| s.labels.clone()).collect();
        assert_eq!(
            label_sets,
            vec![BTreeMap::new(), labels(&[("a", "bc")]), labels(&[("ab", "c")])]
        );
        assert_eq!(merged[1].points, vec![Point::new(1, 2.0), Point::new(2, 4.0)]);
        assert_eq!(merged[2].points, vec![Point::new(1, 1.0)]);
    }

    #[test]
    fn test_from_window_clips_points() {
        let data = CachedSeriesData::from_window(
            100,
            200,
            vec![Series::new(
                BTreeMap::new(),
                vec![
                    Point::new(60, 1.0),
                    Point::new(100, 2.0),
                    Point::new(200, 3.0),
                    Point::new(240, 4.0),
                ],
            )],
        );
        assert_eq!(data.data[0].points, vec![Point::new(100, 2.0), Point::new(200, 3.0)]);
    }

    #[test]
    fn test_truncation_drops_partial_buckets() {
        let s = Series::new(
            labels(&[("service", "api")]),
            vec![
                Point::new(60_000, 1.0),
                Point::new(120_000, 2.0),
                Point::new(180_000, 3.0),
                Point::new(240_000, 4.0),
            ],
        );
        // miss [90s, 250s]: bucket 60s starts before the miss, bucket 240s is cut at 250s
        let (filtered, start, end) = BoundaryTruncation::AggregationWindow
            .filter_series_points(&[s.clone()], 90_000, 250_000, 60);
        assert_eq!(start, 120_000);
        assert_eq!(end, 240_000);
        assert_eq!(
            filtered[0].points,
            vec![Point::new(120_000, 2.0), Point::new(180_000, 3.0)]
        );

        let (unfiltered, start, end) =
            BoundaryTruncation::Disabled.filter_series_points(&[s.clone()], 90_000, 250_000, 60);
        assert_eq!((start, end), (90_000, 250_000));
        assert_eq!(unfiltered, vec![s]);
    }

    #[test]
    fn test_truncation_aligned_window() {
        let s = Series::new(
            BTreeMap::new(),
            vec![Point::new(60_000, 1.0), Point::new(120_000, 2.0), Point::new(180_000, 3.0)],
        );
        let (filtered, start, end) =
            BoundaryTruncation::AggregationWindow.filter_series_points(&[s], 60_000, 180_000, 60);
        assert_eq!((start, end), (60_000, 180_000));
        assert_eq!(filtered[0].points, vec![Point::new(60_000, 1.0), Point::new(120_000, 2.0)]);
    }

    #[test]
    fn test_truncation_short_window_caches_nothing() {
        let s = Series::new(BTreeMap::new(), vec![Point::new(60_000, 1.0)]);
        let (filtered, start, end) =
            BoundaryTruncation::AggregationWindow.filter_series_points(&[s], 61_000, 100_000, 60);
        assert!(filtered.is_empty());
        assert_eq!((start, end), (61_000, 100_000));
    }

    #[test]
    fn test_truncation_keeps_empty_series() {
        let s = Series::new(labels(&[("service", "api")]), vec![]);
        let (filtered, _, _) = BoundaryTruncation::AggregationWindow
            .filter_series_points(&[s.clone()], 0, 600_000, 60);
        assert_eq!(filtered, vec![s]);
    }
}
