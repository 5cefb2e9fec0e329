//! Point alignment for range query results.
//!
//! Samples close to "now" may still be incomplete because ingestion hasn't
//! caught up. Range queries replace such trailing points with the last value
//! known to be settled, and every response drops NaN samples and empty series.

use std::collections::HashMap;

use crate::storage::data::SeriesResult;

/// Drops NaN samples, samples at or before the per-series cursor in `filter`,
/// and series left without samples. Series that need no change are passed
/// through untouched.
pub fn remove_filtered_values_and_timeseries(
    mut tss: Vec<SeriesResult>,
    filter: Option<&HashMap<u64, i64>>,
) -> Vec<SeriesResult> {
    tss.retain_mut(|ts| {
        let has_nans = ts.values.iter().any(|v| v.is_nan());
        let cursor = filter.and_then(|f| f.get(&ts.metric_name_hash).copied());
        if !has_nans && cursor.is_none() {
            return !ts.values.is_empty();
        }

        let last_ts = cursor.unwrap_or(i64::MIN);
        compact(ts, |ts, v| !v.is_nan() && ts > last_ts);
        !ts.values.is_empty()
    });
    tss
}

/// Keeps the rows for which `keep(timestamp, value)` holds, moving them to the
/// front of the arrays in a single left-to-right pass.
fn compact(ts: &mut SeriesResult, keep: impl Fn(i64, f64) -> bool) {
    let n = ts.values.len().min(ts.timestamps.len());
    let mut dst = 0;
    for src in 0..n {
        if !keep(ts.timestamps[src], ts.values[src]) {
            continue;
        }
        if dst != src {
            ts.timestamps[dst] = ts.timestamps[src];
            ts.values[dst] = ts.values[src];
            if let Some(payloads) = ts.payloads.as_mut() {
                payloads.swap(dst, src);
            }
        }
        dst += 1;
    }
    ts.timestamps.truncate(dst);
    ts.values.truncate(dst);
    if let Some(payloads) = ts.payloads.as_mut() {
        payloads.truncate(dst);
    }
}

/// Replaces values of samples in `(start, end]` with the last value at or
/// before `start`, or NaN when there is none.
///
/// Series whose last sample lies beyond `end` are left as is: such a shift
/// comes from an `offset` in the query and it's unknown which points are
/// incomplete.
pub fn adjust_last_points(mut tss: Vec<SeriesResult>, start: i64, end: i64) -> Vec<SeriesResult> {
    for ts in tss.iter_mut() {
        let n = ts.timestamps.len().min(ts.values.len());
        if n == 0 || ts.timestamps[n - 1] > end {
            continue;
        }

        // First sample after the visibility boundary
        let first = ts.timestamps[..n].partition_point(|&t| t <= start);
        let last_value = if first > 0 {
            ts.values[first - 1]
        } else {
            f64::NAN
        };
        for j in first..n {
            if ts.timestamps[j] > end {
                break;
            }
            ts.values[j] = last_value;
        }
    }
    tss
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::data::MetricName;

    fn series(name: &str, timestamps: Vec<i64>, values: Vec<f64>) -> SeriesResult {
        SeriesResult::new(MetricName::new(name), timestamps, values)
    }

    #[test]
    fn test_fast_path_keeps_series() {
        let tss = vec![
            series("a", vec![1, 2], vec![1.0, 2.0]),
            series("empty", vec![], vec![]),
        ];
        let out = remove_filtered_values_and_timeseries(tss, None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_nans_removed_in_parallel() {
        let tss = vec![
            series("a", vec![1, 2, 3, 4], vec![f64::NAN, 2.0, f64::NAN, 4.0]).with_payloads(vec![
                b"p1".to_vec(),
                b"p2".to_vec(),
                b"p3".to_vec(),
                b"p4".to_vec(),
            ]),
            series("all_nan", vec![1, 2], vec![f64::NAN, f64::NAN]),
        ];
        let out = remove_filtered_values_and_timeseries(tss, None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamps, vec![2, 4]);
        assert_eq!(out[0].values, vec![2.0, 4.0]);
        assert_eq!(
            out[0].payloads.as_ref().unwrap(),
            &vec![b"p2".to_vec(), b"p4".to_vec()]
        );
        assert!(out[0].validate().is_ok());
        assert!(out.iter().all(|ts| ts.values.iter().all(|v| !v.is_nan())));
    }

    #[test]
    fn test_tail_filter() {
        let a = series("a", vec![10, 20, 30], vec![1.0, 2.0, 3.0]);
        let b = series("b", vec![10, 20], vec![1.0, 2.0]);
        let mut filter = HashMap::new();
        filter.insert(a.metric_name_hash, 20);

        let out = remove_filtered_values_and_timeseries(vec![a.clone(), b.clone()], Some(&filter));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].timestamps, vec![30]);
        // No cursor for `b`, nothing dropped
        assert_eq!(out[1].timestamps, vec![10, 20]);

        // Applying the same filter again changes nothing
        let again = remove_filtered_values_and_timeseries(out.clone(), Some(&filter));
        assert_eq!(again, out);

        // A cursor at the last sample removes the whole series
        filter.insert(b.metric_name_hash, 20);
        let out = remove_filtered_values_and_timeseries(vec![b], Some(&filter));
        assert!(out.is_empty());
    }

    #[test]
    fn test_adjust_last_points() {
        let tss = vec![series(
            "a",
            vec![1000, 2000, 3000, 4000],
            vec![1.0, 2.0, 3.0, 4.0],
        )];
        let out = adjust_last_points(tss, 2000, 5000);
        assert_eq!(out[0].values, vec![1.0, 2.0, 2.0, 2.0]);

        // No settled sample before the boundary
        let tss = vec![series("a", vec![3000, 4000], vec![3.0, 4.0])];
        let out = adjust_last_points(tss, 2000, 5000);
        assert!(out[0].values.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_adjust_last_points_skips_shifted_series() {
        let tss = vec![series("a", vec![1000, 2000, 6000], vec![1.0, 2.0, 6.0])];
        let out = adjust_last_points(tss.clone(), 1000, 5000);
        assert_eq!(out, tss);
    }

    #[test]
    fn test_adjust_last_points_stops_at_end() {
        let tss = vec![series("a", vec![1000, 2000, 3000], vec![1.0, 2.0, 3.0])];
        let out = adjust_last_points(tss, 1000, 3000);
        assert_eq!(out[0].values, vec![1.0, 1.0, 1.0]);
    }
}
