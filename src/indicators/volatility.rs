// =============================================================================
// Return Volatility
// =============================================================================
//
// Sample standard deviation of percent returns over the last `periods` bars:
//   r_t = (close_t / close_{t-1} - 1) * 100
//   vol = stdev(r_{n-periods+1} .. r_n)

/// Standard deviation of the last `periods` percent returns.
///
/// Returns 0.0 when there are not more than `periods` closes.
pub fn return_volatility(closes: &[f64], periods: usize) -> f64 {
    if periods < 2 || closes.len() <= periods {
        return 0.0;
    }

    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] / w[0] - 1.0) * 100.0)
        .collect();
    let tail = &returns[returns.len().saturating_sub(periods)..];
    if tail.len() < 2 {
        return 0.0;
    }

    let n = tail.len() as f64;
    let mean = tail.iter().sum::<f64>() / n;
    let var = tail.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let vol = var.sqrt();
    if vol.is_finite() {
        vol
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_growth_has_zero_volatility() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        assert!(return_volatility(&closes, 14) < 1e-9);
    }

    #[test]
    fn short_input_is_zero() {
        assert_eq!(return_volatility(&[1.0, 2.0, 3.0], 14), 0.0);
        assert_eq!(return_volatility(&vec![1.0; 14], 14), 0.0);
    }

    #[test]
    fn alternating_returns() {
        // Returns alternate +10 % / -9.0909 %.
        let closes: Vec<f64> = (0..16)
            .map(|i| if i % 2 == 0 { 100.0 } else { 110.0 })
            .collect();
        let vol = return_volatility(&closes, 14);
        assert!(vol > 9.0 && vol < 11.0, "got {vol}");
    }
}
