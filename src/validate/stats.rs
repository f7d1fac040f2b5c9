// Small statistics helpers for response-time analysis.

use crate::igmp::{Timestamp, seconds_between};

/// Median of `values`, averaging the two middle elements for even lengths.
/// Returns `None` for an empty slice.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Sample variance (n - 1 denominator). Needs at least two values.
pub fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    Some(ss / (n - 1.0))
}

/// Gaps between consecutive arrivals, the first one measured from `origin`.
///
/// `arrivals` must be in chronological order.
pub fn inter_arrival_gaps(origin: Timestamp, arrivals: &[Timestamp]) -> Vec<f64> {
    let mut prev = origin;
    arrivals
        .iter()
        .map(|&t| {
            let gap = seconds_between(prev, t);
            prev = t;
            gap
        })
        .collect()
}
