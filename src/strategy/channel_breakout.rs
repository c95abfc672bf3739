// =============================================================================
// Channel Breakout Strategy
// =============================================================================
//
// Trades closes that break out of the high/low channel of the preceding
// `period` bars, confirmed by volume and a 20/50 SMA trend filter.
//
// Indicators (aligned with the window):
//   upper/lower channel = max(high) / min(low) over the `period` bars before
//                         the current one
//   exit channel        = same over `exit_period` bars
//   atr                 = mean true range over `atr_period` bars
//   volume_ratio        = volume / mean(volume over `period` bars)
//   trend_up            = SMA20(close) > SMA50(close)
//   roc                 = close / close[period] - 1
//   volatility_pct      = atr / close * 100
//
// Rules (first match wins):
//   1. buy        close crosses above upper, volume_ratio > threshold, trend up
//   2. sell       close crosses below lower, volume_ratio > threshold, trend down
//   3. exit_long  close crosses below the exit channel low       (0.7)
//   4. exit_short close crosses above the exit channel high      (0.7)
//   5. buy_weak / sell_weak  within 0.5 * ATR inside a bound     (0.3)
//   6. neutral
//
// Entry strength = min(0.9, 0.5 + volume_ratio/10 + momentum*10 + volatility/100)
// where momentum is the ROC in the trade's direction (0 against it).

use anyhow::{bail, Result};
use serde_json::Value;

use crate::indicators::atr::atr_series;
use crate::indicators::roc::roc_series;
use crate::indicators::rolling::{lag, lift, rolling_max, rolling_mean, rolling_min, sma};
use crate::indicators::volatility::return_volatility;
use crate::market_data::Candle;
use crate::runtime_config::ChannelBreakoutParams;
use crate::strategy::indicator_set::IndicatorSet;
use crate::strategy::signal::{Signal, SignalLevels};
use crate::strategy::StrategyEngine;
use crate::types::SignalKind;

const TREND_FAST: usize = 20;
const TREND_SLOW: usize = 50;
const ENTRY_STRENGTH_CAP: f64 = 0.9;
const EXIT_STRENGTH: f64 = 0.7;
const WEAK_STRENGTH: f64 = 0.3;
const WEAK_ZONE_ATR: f64 = 0.5;
const RISK_REWARD: f64 = 1.5;
const RETURN_VOL_PERIODS: usize = 14;

pub struct ChannelBreakout {
    params: ChannelBreakoutParams,
}

impl ChannelBreakout {
    pub fn new(params: ChannelBreakoutParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ChannelBreakoutParams {
        &self.params
    }

    fn entry_strength(volume_ratio: f64, momentum: f64, volatility_pct: f64) -> f64 {
        (0.5 + volume_ratio / 10.0 + momentum.max(0.0) * 10.0 + volatility_pct / 100.0)
            .min(ENTRY_STRENGTH_CAP)
    }

    fn levels(&self, kind: SignalKind, close: f64, atr: f64) -> SignalLevels {
        let risk = atr * self.params.atr_multiplier;
        match kind {
            SignalKind::Buy => SignalLevels {
                stop_loss: Some(close - risk),
                take_profit: Some(close + risk * RISK_REWARD),
            },
            SignalKind::Sell => SignalLevels {
                stop_loss: Some(close + risk),
                take_profit: Some(close - risk * RISK_REWARD),
            },
            _ => SignalLevels::default(),
        }
    }
}

impl Default for ChannelBreakout {
    fn default() -> Self {
        Self::new(ChannelBreakoutParams::default())
    }
}

fn zip_with(
    a: &[Option<f64>],
    b: &[Option<f64>],
    f: impl Fn(f64, f64) -> Option<f64>,
) -> Vec<Option<f64>> {
    a.iter()
        .zip(b)
        .map(|(x, y)| match (x, y) {
            (Some(x), Some(y)) => f(*x, *y).filter(|v| v.is_finite()),
            _ => None,
        })
        .collect()
}

impl StrategyEngine for ChannelBreakout {
    fn name(&self) -> &str {
        "channel_breakout"
    }

    fn timeframe(&self) -> &str {
        &self.params.timeframe
    }

    fn parameters(&self) -> Value {
        serde_json::to_value(&self.params).unwrap_or(Value::Null)
    }

    fn min_required_candles(&self) -> usize {
        self.params.period.max(self.params.atr_period) + 10
    }

    fn compute_indicators(&self, window: &[Candle]) -> Result<IndicatorSet> {
        let p = &self.params;
        if p.period == 0 || p.exit_period == 0 || p.atr_period == 0 {
            bail!("channel breakout periods must be positive");
        }

        let closes: Vec<f64> = window.iter().map(|c| c.close).collect();
        let highs = lift(&window.iter().map(|c| c.high).collect::<Vec<_>>());
        let lows = lift(&window.iter().map(|c| c.low).collect::<Vec<_>>());
        let volumes = lift(&window.iter().map(|c| c.volume).collect::<Vec<_>>());

        // ── Channels over the bars before the current one ──
        let upper = lag(&rolling_max(&highs, p.period), 1);
        let lower = lag(&rolling_min(&lows, p.period), 1);
        let middle = zip_with(&upper, &lower, |u, l| Some((u + l) / 2.0));
        let exit_upper = lag(&rolling_max(&highs, p.exit_period), 1);
        let exit_lower = lag(&rolling_min(&lows, p.exit_period), 1);

        // ── Volatility ──
        let atr = atr_series(window, p.atr_period);
        let close_series = lift(&closes);
        let volatility_pct = zip_with(&atr, &close_series, |a, c| {
            (c != 0.0).then(|| a / c * 100.0)
        });

        // ── Volume ──
        let avg_volume = rolling_mean(&volumes, p.period);
        let volume_ratio = zip_with(&volumes, &avg_volume, |v, avg| (avg > 0.0).then(|| v / avg));

        // ── Trend and momentum ──
        let sma_fast = sma(&closes, TREND_FAST);
        let sma_slow = sma(&closes, TREND_SLOW);
        let trend_up = zip_with(&sma_fast, &sma_slow, |f, s| Some(if f > s { 1.0 } else { 0.0 }));
        let roc = roc_series(&closes, p.period);

        let mut set = IndicatorSet::new();
        set.insert_series("upper_channel", upper);
        set.insert_series("lower_channel", lower);
        set.insert_series("middle_channel", middle);
        set.insert_series("exit_upper", exit_upper);
        set.insert_series("exit_lower", exit_lower);
        set.insert_series("atr", atr);
        set.insert_series("volatility_pct", volatility_pct);
        set.insert_series("volume_ratio", volume_ratio);
        set.insert_series("sma_fast", sma_fast);
        set.insert_series("sma_slow", sma_slow);
        set.insert_series("trend_up", trend_up);
        set.insert_series("roc", roc);
        set.insert_scalar(
            "return_volatility",
            return_volatility(&closes, RETURN_VOL_PERIODS),
        );
        Ok(set)
    }

    fn generate_signal(&self, window: &[Candle], ind: &IndicatorSet) -> Result<Signal> {
        let [.., prev_bar, last_bar] = window else {
            bail!("channel breakout needs at least two candles");
        };
        let (close, prev_close) = (last_bar.close, prev_bar.close);

        let (Some(upper), Some(lower), Some(exit_upper), Some(exit_lower), Some(atr)) = (
            ind.latest("upper_channel"),
            ind.latest("lower_channel"),
            ind.latest("exit_upper"),
            ind.latest("exit_lower"),
            ind.latest("atr"),
        ) else {
            return Ok(Signal::neutral("indicators not ready"));
        };

        let volume_ratio = ind.latest("volume_ratio").unwrap_or(0.0);
        let roc = ind.latest("roc").unwrap_or(0.0);
        let volatility_pct = ind.latest("volatility_pct").unwrap_or(0.0);
        // An unready trend counts as "not up": it blocks buys, not sells.
        let trend_up = ind.latest("trend_up").is_some_and(|t| t > 0.0);
        let trend_down = !trend_up;
        let volume_confirmed = volume_ratio > self.params.volume_threshold;

        let signal = if close > upper && prev_close <= upper && volume_confirmed && trend_up {
            Signal::new(
                SignalKind::Buy,
                Self::entry_strength(volume_ratio, roc, volatility_pct),
                format!(
                    "breakout above channel high {upper:.2} on {volume_ratio:.2}x volume in uptrend"
                ),
            )
        } else if close < lower && prev_close >= lower && volume_confirmed && trend_down {
            Signal::new(
                SignalKind::Sell,
                Self::entry_strength(volume_ratio, -roc, volatility_pct),
                format!(
                    "breakdown below channel low {lower:.2} on {volume_ratio:.2}x volume in downtrend"
                ),
            )
        } else if close < exit_lower && prev_close >= exit_lower {
            Signal::new(
                SignalKind::ExitLong,
                EXIT_STRENGTH,
                format!("close below exit channel low {exit_lower:.2}"),
            )
        } else if close > exit_upper && prev_close <= exit_upper {
            Signal::new(
                SignalKind::ExitShort,
                EXIT_STRENGTH,
                format!("close above exit channel high {exit_upper:.2}"),
            )
        } else if close > upper - atr * WEAK_ZONE_ATR && close < upper {
            Signal::new(
                SignalKind::BuyWeak,
                WEAK_STRENGTH,
                format!("approaching channel high {upper:.2}"),
            )
        } else if close < lower + atr * WEAK_ZONE_ATR && close > lower {
            Signal::new(
                SignalKind::SellWeak,
                WEAK_STRENGTH,
                format!("approaching channel low {lower:.2}"),
            )
        } else {
            Signal::neutral("no breakout setup")
        };

        let levels = self.levels(signal.kind, close, atr);
        let mut signal = signal
            .with_levels(levels)
            .with_detail("price", close)
            .with_detail("upper_channel", upper)
            .with_detail("lower_channel", lower)
            .with_detail("exit_upper", exit_upper)
            .with_detail("exit_lower", exit_lower)
            .with_detail("atr", atr)
            .with_detail("volume_ratio", volume_ratio)
            .with_detail("trend_up", if trend_up { 1.0 } else { 0.0 });
        if signal.kind.is_entry() {
            signal = signal.with_detail("risk_reward_ratio", RISK_REWARD);
        }
        Ok(signal)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{analyze, SignalCache};

    /// Bars with the given closes; each bar spans `below` under and `above`
    /// over its close.
    fn bars(closes: &[f64], below: f64, above: f64) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle::new(i as i64 * 900_000, c, c + above, c - below, c, 100.0))
            .collect()
    }

    /// 24 slowly rising closes, then `last`.
    fn rising_then(last: impl Fn(f64) -> f64) -> Vec<f64> {
        let mut closes: Vec<f64> = (0..24).map(|i| 100.0 + 0.01 * i as f64).collect();
        let c24 = closes[23];
        closes.push(last(c24));
        closes
    }

    fn falling_then(last: impl Fn(f64) -> f64) -> Vec<f64> {
        let mut closes: Vec<f64> = (0..24).map(|i| 100.0 - 0.01 * i as f64).collect();
        let c24 = closes[23];
        closes.push(last(c24));
        closes
    }

    #[test]
    fn breakout_with_volume_and_trend_is_a_buy() {
        let strategy = ChannelBreakout::default();
        let window = bars(&rising_then(|c| c * 1.01), 0.5, 0.0);

        let mut ind = strategy.compute_indicators(&window).unwrap();
        // Bar 24 closed exactly on the prior channel high.
        assert!((ind.previous("upper_channel").unwrap() - window[22].close).abs() < 1e-9);
        assert!((ind.latest("upper_channel").unwrap() - window[23].close).abs() < 1e-9);

        ind.insert_scalar("volume_ratio", 2.0);
        ind.insert_flag("trend_up", true);
        let signal = strategy.generate_signal(&window, &ind).unwrap();

        let close = window[24].close;
        let atr = ind.latest("atr").unwrap();
        assert_eq!(signal.kind, SignalKind::Buy);
        assert!(signal.strength > 0.5 && signal.strength < 0.9, "{}", signal.strength);
        assert!((signal.levels.stop_loss.unwrap() - (close - 2.0 * atr)).abs() < 1e-9);
        assert!((signal.levels.take_profit.unwrap() - (close + 3.0 * atr)).abs() < 1e-9);
        assert_eq!(signal.details["risk_reward_ratio"], 1.5);
    }

    #[test]
    fn breakout_without_volume_is_not_a_buy() {
        let strategy = ChannelBreakout::default();
        let window = bars(&rising_then(|c| c * 1.01), 0.5, 0.0);
        let mut ind = strategy.compute_indicators(&window).unwrap();
        ind.insert_flag("trend_up", true);
        // Flat volume: ratio 1.0.
        assert!((ind.latest("volume_ratio").unwrap() - 1.0).abs() < 1e-9);
        let signal = strategy.generate_signal(&window, &ind).unwrap();
        assert_ne!(signal.kind, SignalKind::Buy);
    }

    #[test]
    fn breakdown_with_volume_in_downtrend_is_a_sell() {
        let strategy = ChannelBreakout::default();
        let window = bars(&falling_then(|c| c * 0.99), 0.0, 0.5);
        let mut ind = strategy.compute_indicators(&window).unwrap();
        ind.insert_scalar("volume_ratio", 2.0);
        ind.insert_flag("trend_up", false);
        let signal = strategy.generate_signal(&window, &ind).unwrap();

        let close = window[24].close;
        let atr = ind.latest("atr").unwrap();
        assert_eq!(signal.kind, SignalKind::Sell);
        assert!(signal.strength > 0.5 && signal.strength <= 0.9);
        assert!((signal.levels.stop_loss.unwrap() - (close + 2.0 * atr)).abs() < 1e-9);
        assert!((signal.levels.take_profit.unwrap() - (close - 3.0 * atr)).abs() < 1e-9);
    }

    #[test]
    fn unknown_trend_blocks_buys_but_not_sells() {
        let strategy = ChannelBreakout::default();

        let window = bars(&falling_then(|c| c * 0.99), 0.0, 0.5);
        let mut ind = strategy.compute_indicators(&window).unwrap();
        ind.insert_scalar("volume_ratio", 2.0);
        // 25 bars cannot fill the 50-bar SMA.
        assert!(ind.latest("trend_up").is_none());
        let signal = strategy.generate_signal(&window, &ind).unwrap();
        assert_eq!(signal.kind, SignalKind::Sell);
        assert_eq!(signal.details["trend_up"], 0.0);

        let window = bars(&rising_then(|c| c * 1.01), 0.5, 0.0);
        let mut ind = strategy.compute_indicators(&window).unwrap();
        ind.insert_scalar("volume_ratio", 2.0);
        assert!(ind.latest("trend_up").is_none());
        let signal = strategy.generate_signal(&window, &ind).unwrap();
        assert_ne!(signal.kind, SignalKind::Buy);
    }

    #[test]
    fn warm_up_window_breakdown_sells_through_analyze() {
        let strategy = ChannelBreakout::default();
        let cache = SignalCache::new();

        // 39 slowly falling bars, then a 1% drop on four times the volume.
        let mut window: Vec<Candle> = (0..39)
            .map(|i| {
                let c = 100.0 - 0.01 * i as f64;
                Candle::new(i as i64 * 900_000, c, c + 0.5, c, c, 100.0)
            })
            .collect();
        let last = window[38].close * 0.99;
        window.push(Candle::new(39 * 900_000, last, last + 0.5, last, last, 400.0));
        assert!(window.len() >= strategy.min_required_candles() && window.len() < 50);

        let rec = analyze(&strategy, &cache, &window, "BTCUSDT");
        let ind = rec.indicators.as_ref().unwrap();
        assert!(ind.latest("trend_up").is_none());
        assert!(ind.latest("volume_ratio").unwrap() > 1.5);

        assert_eq!(rec.signal.kind, SignalKind::Sell);
        let atr = ind.latest("atr").unwrap();
        assert!((rec.signal.levels.stop_loss.unwrap() - (last + 2.0 * atr)).abs() < 1e-9);
        assert_eq!(cache.get("BTCUSDT").unwrap().signal.kind, SignalKind::Sell);
    }

    #[test]
    fn drop_through_exit_channel_exits_long() {
        let strategy = ChannelBreakout::default();
        let window = bars(&rising_then(|_| 99.0), 0.5, 0.0);
        let ind = strategy.compute_indicators(&window).unwrap();
        let signal = strategy.generate_signal(&window, &ind).unwrap();
        assert_eq!(signal.kind, SignalKind::ExitLong);
        assert_eq!(signal.strength, 0.7);
        assert_eq!(signal.levels, SignalLevels::default());
        assert!(!signal.details.contains_key("risk_reward_ratio"));
    }

    #[test]
    fn pop_through_exit_channel_exits_short() {
        let strategy = ChannelBreakout::default();
        // Rising past the exit high but with flat volume: no buy.
        let window = bars(&rising_then(|c| c + 1.0), 0.5, 0.0);
        let ind = strategy.compute_indicators(&window).unwrap();
        let signal = strategy.generate_signal(&window, &ind).unwrap();
        assert_eq!(signal.kind, SignalKind::ExitShort);
        assert_eq!(signal.strength, 0.7);
    }

    #[test]
    fn close_just_under_the_high_is_weak_buy() {
        let strategy = ChannelBreakout::default();
        let window = bars(&rising_then(|c| c - 0.1), 0.5, 0.0);
        let ind = strategy.compute_indicators(&window).unwrap();
        let signal = strategy.generate_signal(&window, &ind).unwrap();
        assert_eq!(signal.kind, SignalKind::BuyWeak);
        assert_eq!(signal.strength, 0.3);
    }

    #[test]
    fn close_just_over_the_low_is_weak_sell() {
        let strategy = ChannelBreakout::default();
        let window = bars(&falling_then(|c| c + 0.1), 0.0, 0.5);
        let ind = strategy.compute_indicators(&window).unwrap();
        let signal = strategy.generate_signal(&window, &ind).unwrap();
        assert_eq!(signal.kind, SignalKind::SellWeak);
        assert_eq!(signal.strength, 0.3);
    }

    #[test]
    fn mid_channel_is_neutral() {
        let strategy = ChannelBreakout::default();
        let window = bars(&[100.0; 40], 1.0, 1.0);
        let ind = strategy.compute_indicators(&window).unwrap();
        let signal = strategy.generate_signal(&window, &ind).unwrap();
        assert_eq!(signal.kind, SignalKind::Neutral);
        assert_eq!(signal.strength, 0.0);
    }

    #[test]
    fn short_window_reports_not_ready() {
        let strategy = ChannelBreakout::default();
        let window = bars(&[100.0; 12], 1.0, 1.0);
        let ind = strategy.compute_indicators(&window).unwrap();
        let signal = strategy.generate_signal(&window, &ind).unwrap();
        assert_eq!(signal.kind, SignalKind::Neutral);
        assert!(signal.reason.contains("not ready"));
    }

    #[test]
    fn series_stay_aligned_with_window() {
        let strategy = ChannelBreakout::default();
        let window = bars(&[100.0; 40], 1.0, 1.0);
        let ind = strategy.compute_indicators(&window).unwrap();
        assert_eq!(ind.oversized_series(window.len()), None);
        assert_eq!(ind.series("atr").unwrap().len(), 40);
    }

    #[test]
    fn analyze_gates_on_history() {
        let strategy = ChannelBreakout::default();
        assert_eq!(strategy.min_required_candles(), 30);
        let cache = SignalCache::new();
        let rec = analyze(&strategy, &cache, &bars(&rising_then(|c| c), 0.5, 0.0), "BTCUSDT");
        assert_eq!(rec.signal.kind, SignalKind::Neutral);
        assert!(rec.indicators.is_none());
    }

    #[test]
    fn strength_stays_in_unit_interval() {
        let strategy = ChannelBreakout::default();
        let cache = SignalCache::new();
        for seed in 1..40u64 {
            // Small LCG walk with volume spikes.
            let mut state = seed;
            let mut next = || {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as f64 / (1u64 << 31) as f64
            };
            let mut price = 100.0;
            let window: Vec<Candle> = (0..120)
                .map(|i| {
                    price *= 1.0 + (next() - 0.5) * 0.04;
                    let spread = price * 0.01 * next();
                    let volume = 100.0 * (1.0 + 4.0 * next());
                    Candle::new(i * 60_000, price, price + spread, price - spread, price, volume)
                })
                .collect();
            let rec = analyze(&strategy, &cache, &window, "BTCUSDT");
            let s = rec.signal.strength;
            assert!((0.0..=1.0).contains(&s), "seed {seed}: strength {s}");
        }
    }

    #[test]
    fn parameters_expose_config() {
        let strategy = ChannelBreakout::default();
        let params = strategy.parameters();
        assert_eq!(params["period"], 20);
        assert_eq!(params["atr_multiplier"], 2.0);
        assert_eq!(strategy.timeframe(), "15");
    }
}
