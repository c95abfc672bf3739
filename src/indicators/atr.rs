// =============================================================================
// Average True Range (ATR) — Rolling-mean variant
// =============================================================================
//
// ATR measures market volatility by decomposing the entire range of a bar.
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
// The first bar has no previous close, so its TR is H - L.
//
// ATR is the simple mean of the last `period` TR values:
//   ATR_t = (TR_{t-period+1} + ... + TR_t) / period
//
// Series are aligned with the input: element `i` belongs to candle `i`, and
// is `None` until enough history exists.
// =============================================================================

use crate::indicators::rolling::rolling_mean;
use crate::market_data::Candle;

/// True range of every candle.
pub fn true_range_series(candles: &[Candle]) -> Vec<Option<f64>> {
    candles
        .iter()
        .enumerate()
        .map(|(i, c)| {
            // f64::max drops NaN operands, so reject them up front.
            if !(c.high.is_finite() && c.low.is_finite()) {
                return None;
            }
            let hl = c.high - c.low;
            let tr = match i.checked_sub(1).map(|p| candles[p].close) {
                Some(prev_close) => hl
                    .max((c.high - prev_close).abs())
                    .max((c.low - prev_close).abs()),
                None => hl,
            };
            tr.is_finite().then_some(tr)
        })
        .collect()
}

/// ATR series aligned with `candles`.
///
/// # Returns
/// All `None` when `period` is zero or longer than the input.
pub fn atr_series(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    rolling_mean(&true_range_series(candles), period)
}

/// Most recent ATR value.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    atr_series(candles, period).last().copied().flatten()
}

/// ATR as a percentage of the latest close.
///
/// Useful for comparing volatility across assets with different price scales.
pub fn calculate_atr_pct(candles: &[Candle], period: usize) -> Option<f64> {
    let atr = calculate_atr(candles, period)?;
    let last_close = candles.last()?.close;
    if last_close == 0.0 {
        return None;
    }
    Some((atr / last_close) * 100.0)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(0, open, high, low, close, 100.0)
    }

    #[test]
    fn atr_period_zero() {
        let candles = vec![candle(100.0, 105.0, 95.0, 102.0); 20];
        assert!(calculate_atr(&candles, 0).is_none());
    }

    #[test]
    fn atr_insufficient_data() {
        let candles = vec![candle(100.0, 105.0, 95.0, 102.0); 10];
        assert!(calculate_atr(&candles, 14).is_none());
    }

    #[test]
    fn first_true_range_is_the_bar_range() {
        let candles = vec![candle(100.0, 104.0, 98.0, 101.0)];
        assert_eq!(true_range_series(&candles), vec![Some(6.0)]);
    }

    #[test]
    fn atr_is_the_plain_mean_of_true_ranges() {
        let candles = vec![
            candle(100.0, 102.0, 98.0, 101.0),  // TR 4
            candle(101.0, 104.0, 99.0, 103.0),  // TR 5
            candle(103.0, 106.0, 100.0, 105.0), // TR 6
            candle(105.0, 108.0, 102.0, 107.0), // TR 6
        ];
        let series = atr_series(&candles, 3);
        assert_eq!(series.len(), 4);
        assert!(series[0].is_none() && series[1].is_none());
        assert!((series[2].unwrap() - 5.0).abs() < 1e-10);
        assert!((series[3].unwrap() - 17.0 / 3.0).abs() < 1e-10);
    }

    #[test]
    fn atr_true_range_uses_prev_close() {
        // Gap up: |115 - 95| = 20 > 115 - 108 = 7.
        let candles = vec![
            candle(100.0, 105.0, 95.0, 95.0),
            candle(110.0, 115.0, 108.0, 112.0),
        ];
        let tr = true_range_series(&candles);
        assert_eq!(tr[1], Some(20.0));
    }

    #[test]
    fn atr_constant_range() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                candle(base, base + 5.0, base - 5.0, base)
            })
            .collect();
        let atr = calculate_atr(&candles, 14).unwrap();
        assert!((atr - 10.0).abs() < 0.2, "expected ATR near 10.0, got {atr}");
    }

    #[test]
    fn atr_pct() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base, base + 3.0, base - 3.0, base + 1.0)
            })
            .collect();
        let val = calculate_atr_pct(&candles, 14).unwrap();
        assert!(val > 0.0 && val.is_finite());
    }

    #[test]
    fn atr_nan_poisons_only_its_windows() {
        let candles = vec![
            candle(100.0, 105.0, 95.0, 100.0),
            candle(100.0, f64::NAN, 95.0, 100.0),
            candle(100.0, 105.0, 95.0, 100.0),
            candle(100.0, 105.0, 95.0, 100.0),
            candle(100.0, 105.0, 95.0, 100.0),
        ];
        let series = atr_series(&candles, 2);
        assert!(series[2].is_none());
        assert!(series[4].is_some());
    }
}
