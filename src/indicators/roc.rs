// =============================================================================
// Rate of Change (ROC) — Momentum Indicator
// =============================================================================
//
// ROC measures the fractional change in price over a look-back period:
//   ROC = close / close_n - 1
//
// 0.01 means +1 %.  Positive ROC indicates upward momentum; negative
// indicates downward.

/// ROC series aligned with `closes`; `None` for the first `period` entries or
/// when the reference close is zero.
pub fn roc_series(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            if period == 0 || i < period {
                return None;
            }
            let prev = closes[i - period];
            if prev == 0.0 {
                return None;
            }
            let roc = close / prev - 1.0;
            roc.is_finite().then_some(roc)
        })
        .collect()
}

/// Return the most recent ROC value.
pub fn current_roc(closes: &[f64], period: usize) -> Option<f64> {
    roc_series(closes, period).last().copied().flatten()
}
