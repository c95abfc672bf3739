// =============================================================================
// Rolling Windows — max / min / mean over aligned series
// =============================================================================
//
// Inputs and outputs are aligned series (`Option<f64>` per bar).  A window
// containing any `None` yields `None`, as does a window that is not yet full.

fn rolling(
    values: &[Option<f64>],
    window: usize,
    reduce: impl Fn(&[f64]) -> f64,
) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if window == 0 || values.len() < window {
        return out;
    }

    let mut buf = Vec::with_capacity(window);
    for end in window..=values.len() {
        buf.clear();
        for v in &values[end - window..end] {
            match v {
                Some(x) if x.is_finite() => buf.push(*x),
                _ => break,
            }
        }
        if buf.len() == window {
            out[end - 1] = Some(reduce(&buf));
        }
    }
    out
}

pub fn rolling_max(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    rolling(values, window, |w| w.iter().copied().fold(f64::NEG_INFINITY, f64::max))
}

pub fn rolling_min(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    rolling(values, window, |w| w.iter().copied().fold(f64::INFINITY, f64::min))
}

pub fn rolling_mean(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    rolling(values, window, |w| w.iter().sum::<f64>() / w.len() as f64)
}

/// Simple moving average of plain values.
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    rolling_mean(&lift(values), period)
}

/// Shift a series forward by `n` bars: element `i` becomes element `i - n`.
///
/// Used to compare a bar against a window that ends on the previous bar.
pub fn lag(series: &[Option<f64>], n: usize) -> Vec<Option<f64>> {
    (0..series.len())
        .map(|i| i.checked_sub(n).and_then(|j| series[j]))
        .collect()
}

/// Wrap plain values as a fully populated series.
pub fn lift(values: &[f64]) -> Vec<Option<f64>> {
    values.iter().map(|v| Some(*v)).collect()
}
