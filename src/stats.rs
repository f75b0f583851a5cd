//! Summary statistics over edge-length and node-age samples.
//!
//! Every function returns `None` for an empty sample.

/// Arithmetic mean.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Mean and unbiased sample variance (0 for a single value).
pub fn mean_and_sample_variance(values: &[f64]) -> Option<(f64, f64)> {
    let m = mean(values)?;
    if values.len() < 2 {
        return Some((m, 0.0));
    }
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    Some((m, ss / (values.len() - 1) as f64))
}

pub fn median(values: &[f64]) -> Option<f64> {
    let sorted = sorted(values);
    let n = sorted.len();
    match n {
        0 => None,
        _ if n % 2 == 1 => Some(sorted[n / 2]),
        _ => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0),
    }
}

pub fn range(values: &[f64]) -> Option<(f64, f64)> {
    let (first, rest) = values.split_first()?;
    Some(rest.iter().fold((*first, *first), |(lo, hi), &v| (lo.min(v), hi.max(v))))
}

/// Shortest interval containing `mass` (e.g. 0.95) of the samples.
pub fn hpd_interval(values: &[f64], mass: f64) -> Option<(f64, f64)> {
    let sorted = sorted(values);
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let width = ((mass * n as f64).ceil() as usize).clamp(1, n);
    sorted
        .windows(width)
        .map(|w| (w[0], w[width - 1]))
        .min_by(|a, b| (a.1 - a.0).total_cmp(&(b.1 - b.0)))
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut v = values.to_vec();
    v.sort_by(f64::total_cmp);
    v
}
