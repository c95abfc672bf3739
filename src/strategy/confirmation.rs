// =============================================================================
// Multi-Timeframe Confirmation
// =============================================================================
//
// Re-runs a strategy on every ladder timeframe coarser than the one that
// produced a signal and measures agreement.
//
// Decision rule:
//   a timeframe confirms  = its signal equals the base kind, or is neutral
//   confidence            = confirmations / timeframes checked
//   confirmed             = confidence >= 0.5   (no timeframes: 1.0, true)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::market_data::CandleSource;
use crate::runtime_config::ConfirmationParams;
use crate::strategy::cache::SignalCache;
use crate::strategy::signal::Signal;
use crate::strategy::{analyze, StrategyEngine};
use crate::types::SignalKind;

const CONFIRMATION_THRESHOLD: f64 = 0.5;

/// Whether a fresh cached signal may stand in for a new analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Fetch and analyze every timeframe on every call.
    AlwaysRecompute,
    /// Reuse a timeframe's cached signal while it is younger than the max age.
    ReuseFresh,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::AlwaysRecompute
    }
}

/// Outcome on one timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframeVerdict {
    pub timeframe: String,
    pub signal: SignalKind,
    pub strength: f64,
    pub confirms: bool,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationResult {
    pub confirmed: bool,
    pub confidence: f64,
    pub confirmations: usize,
    pub total_timeframes: usize,
    pub per_timeframe: Vec<TimeframeVerdict>,
}

/// Ladder entries strictly coarser than `base`.
///
/// A base that is not on the ladder checks everything above the finest rung.
pub fn select_timeframes(ladder: &[String], base: &str) -> Vec<String> {
    match ladder.iter().position(|tf| tf == base) {
        Some(i) => ladder[i + 1..].to_vec(),
        None => ladder.iter().skip(1).cloned().collect(),
    }
}

pub fn confirms(base: SignalKind, other: SignalKind) -> bool {
    other == base || other == SignalKind::Neutral
}

/// `(confirmations, confidence, confirmed)` for a set of timeframe signals.
pub fn tally(base: SignalKind, signals: &[SignalKind]) -> (usize, f64, bool) {
    if signals.is_empty() {
        return (0, 1.0, true);
    }
    let confirmations = signals.iter().filter(|s| confirms(base, **s)).count();
    let confidence = confirmations as f64 / signals.len() as f64;
    (confirmations, confidence, confidence >= CONFIRMATION_THRESHOLD)
}

/// Runs confirmation checks against a candle source.
///
/// Each ladder timeframe keeps its own signal cache so a symbol's 60-minute
/// state never overwrites its 4-hour state.
pub struct MultiTimeframeConfirmer {
    ladder: Vec<String>,
    policy: CachePolicy,
    max_age: Duration,
    candle_limit: usize,
    source: Arc<dyn CandleSource>,
    caches: HashMap<String, Arc<SignalCache>>,
}

impl MultiTimeframeConfirmer {
    pub fn new(params: &ConfirmationParams, source: Arc<dyn CandleSource>) -> Self {
        let caches = params
            .ladder
            .iter()
            .map(|tf| (tf.clone(), Arc::new(SignalCache::new())))
            .collect();
        Self {
            ladder: params.ladder.clone(),
            policy: params.cache_policy,
            max_age: params.max_signal_age(),
            candle_limit: params.candle_limit,
            source,
            caches,
        }
    }

    pub fn ladder(&self) -> &[String] {
        &self.ladder
    }

    pub fn cache(&self, timeframe: &str) -> Option<&Arc<SignalCache>> {
        self.caches.get(timeframe)
    }

    /// Check whether coarser timeframes agree with `base_kind` on `base_timeframe`.
    pub fn confirm(
        &self,
        engine: &dyn StrategyEngine,
        symbol: &str,
        base_timeframe: &str,
        base_kind: SignalKind,
    ) -> ConfirmationResult {
        let timeframes = select_timeframes(&self.ladder, base_timeframe);
        if timeframes.is_empty() {
            debug!(symbol, base_timeframe, "no coarser timeframes, trivially confirmed");
            return ConfirmationResult {
                confirmed: true,
                confidence: 1.0,
                confirmations: 0,
                total_timeframes: 0,
                per_timeframe: Vec::new(),
            };
        }

        info!(
            symbol,
            signal = %base_kind,
            timeframes = %timeframes.join(","),
            "checking multi-timeframe confirmation"
        );

        let per_timeframe: Vec<TimeframeVerdict> = timeframes
            .iter()
            .map(|tf| {
                let (signal, from_cache) = self.signal_on(engine, symbol, tf);
                let verdict = TimeframeVerdict {
                    timeframe: tf.clone(),
                    signal: signal.kind,
                    strength: signal.strength,
                    confirms: confirms(base_kind, signal.kind),
                    from_cache,
                };
                debug!(
                    symbol,
                    timeframe = %tf,
                    signal = %verdict.signal,
                    confirms = verdict.confirms,
                    from_cache,
                    "timeframe verdict"
                );
                verdict
            })
            .collect();

        let kinds: Vec<SignalKind> = per_timeframe.iter().map(|v| v.signal).collect();
        let (confirmations, confidence, confirmed) = tally(base_kind, &kinds);

        info!(
            symbol,
            signal = %base_kind,
            confirmations,
            total = per_timeframe.len(),
            confidence,
            confirmed,
            "multi-timeframe confirmation"
        );

        ConfirmationResult {
            confirmed,
            confidence,
            confirmations,
            total_timeframes: per_timeframe.len(),
            per_timeframe,
        }
    }

    fn signal_on(&self, engine: &dyn StrategyEngine, symbol: &str, timeframe: &str) -> (Signal, bool) {
        let cache = match self.caches.get(timeframe) {
            Some(c) => c.clone(),
            None => Arc::new(SignalCache::new()),
        };

        if self.policy == CachePolicy::ReuseFresh && !cache.should_refresh(symbol, self.max_age) {
            if let Some(state) = cache.get(symbol) {
                return (state.signal.clone(), true);
            }
        }

        match self.source.get_candles(symbol, timeframe, self.candle_limit) {
            Ok(window) => (analyze(engine, &cache, &window, symbol).signal, false),
            Err(e) => {
                warn!(symbol, timeframe, error = %e, "candle fetch failed, counting timeframe as neutral");
                (Signal::neutral(format!("candle fetch failed: {e:#}")), false)
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Candle;
    use crate::strategy::indicator_set::IndicatorSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ladder() -> Vec<String> {
        ["15", "60", "240", "D"].iter().map(|s| s.to_string()).collect()
    }

    /// Serves `n` flat bars per interval; intervals in `failing` error out.
    struct FakeSource {
        fetches: AtomicUsize,
        failing: Vec<String>,
    }

    impl CandleSource for FakeSource {
        fn get_candles(&self, _symbol: &str, interval: &str, _limit: usize) -> anyhow::Result<Vec<Candle>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.failing.iter().any(|f| f == interval) {
                anyhow::bail!("no data for {interval}");
            }
            // Encode the interval in the close so the strategy can tell them apart.
            let tag = match interval {
                "60" => 1.0,
                "240" => 2.0,
                _ => 3.0,
            };
            Ok((0..5).map(|i| Candle::new(i, tag, tag, tag, tag, 1.0)).collect())
        }
    }

    /// Maps the interval tag in the close to a scripted signal.
    struct Scripted {
        by_tag: HashMap<u32, SignalKind>,
    }

    impl StrategyEngine for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn timeframe(&self) -> &str {
            "15"
        }

        fn min_required_candles(&self) -> usize {
            1
        }

        fn compute_indicators(&self, _window: &[Candle]) -> anyhow::Result<IndicatorSet> {
            Ok(IndicatorSet::new())
        }

        fn generate_signal(&self, window: &[Candle], _: &IndicatorSet) -> anyhow::Result<Signal> {
            let tag = window[0].close as u32;
            let kind = self.by_tag.get(&tag).copied().unwrap_or_default();
            Ok(Signal::new(kind, 0.5, "scripted"))
        }
    }

    fn scripted(h1: SignalKind, h4: SignalKind, d: SignalKind) -> Scripted {
        Scripted {
            by_tag: HashMap::from([(1, h1), (2, h4), (3, d)]),
        }
    }

    fn confirmer(policy: CachePolicy, failing: &[&str]) -> (MultiTimeframeConfirmer, Arc<FakeSource>) {
        let source = Arc::new(FakeSource {
            fetches: AtomicUsize::new(0),
            failing: failing.iter().map(|s| s.to_string()).collect(),
        });
        let params = ConfirmationParams {
            ladder: ladder(),
            cache_policy: policy,
            ..ConfirmationParams::default()
        };
        (MultiTimeframeConfirmer::new(&params, source.clone()), source)
    }

    #[test]
    fn selects_only_coarser_timeframes() {
        let l = ladder();
        assert_eq!(select_timeframes(&l, "15"), vec!["60", "240", "D"]);
        assert_eq!(select_timeframes(&l, "240"), vec!["D"]);
        assert!(select_timeframes(&l, "D").is_empty());
        // Off-ladder base: everything above the finest rung.
        assert_eq!(select_timeframes(&l, "5"), vec!["60", "240", "D"]);
    }

    #[test]
    fn neutral_counts_as_agreement() {
        let (n, conf, ok) = tally(
            SignalKind::Buy,
            &[SignalKind::Buy, SignalKind::Neutral, SignalKind::Sell],
        );
        assert_eq!(n, 2);
        assert!((conf - 2.0 / 3.0).abs() < 1e-9);
        assert!(ok);

        let (n, conf, ok) = tally(SignalKind::Buy, &[SignalKind::Sell, SignalKind::BuyWeak]);
        assert_eq!(n, 0);
        assert_eq!(conf, 0.0);
        assert!(!ok);

        assert_eq!(tally(SignalKind::Sell, &[]), (0, 1.0, true));
    }

    #[test]
    fn half_agreement_is_enough() {
        let (_, conf, ok) = tally(SignalKind::Sell, &[SignalKind::Sell, SignalKind::Buy]);
        assert_eq!(conf, 0.5);
        assert!(ok);
    }

    #[test]
    fn confirm_runs_each_coarser_timeframe() {
        let (c, source) = confirmer(CachePolicy::AlwaysRecompute, &[]);
        let engine = scripted(SignalKind::Buy, SignalKind::Neutral, SignalKind::Sell);

        let result = c.confirm(&engine, "BTCUSDT", "15", SignalKind::Buy);
        assert_eq!(result.total_timeframes, 3);
        assert_eq!(result.confirmations, 2);
        assert!((result.confidence - 2.0 / 3.0).abs() < 1e-9);
        assert!(result.confirmed);
        let tfs: Vec<&str> = result.per_timeframe.iter().map(|v| v.timeframe.as_str()).collect();
        assert_eq!(tfs, vec!["60", "240", "D"]);
        assert!(!result.per_timeframe[2].confirms);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn coarsest_base_is_trivially_confirmed() {
        let (c, source) = confirmer(CachePolicy::AlwaysRecompute, &[]);
        let engine = scripted(SignalKind::Sell, SignalKind::Sell, SignalKind::Sell);
        let result = c.confirm(&engine, "BTCUSDT", "D", SignalKind::Buy);
        assert!(result.confirmed);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.total_timeframes, 0);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fetch_failure_counts_as_neutral() {
        let (c, _) = confirmer(CachePolicy::AlwaysRecompute, &["240"]);
        let engine = scripted(SignalKind::Sell, SignalKind::Sell, SignalKind::Sell);
        let result = c.confirm(&engine, "BTCUSDT", "60", SignalKind::Buy);
        // 240 failed (neutral, confirms), D says sell.
        assert_eq!(result.total_timeframes, 2);
        assert_eq!(result.confirmations, 1);
        assert!(result.confirmed);
        assert_eq!(result.per_timeframe[0].signal, SignalKind::Neutral);
    }

    #[test]
    fn per_timeframe_caches_do_not_clobber() {
        let (c, _) = confirmer(CachePolicy::AlwaysRecompute, &[]);
        let engine = scripted(SignalKind::Buy, SignalKind::Sell, SignalKind::Neutral);
        c.confirm(&engine, "BTCUSDT", "15", SignalKind::Buy);
        assert_eq!(
            c.cache("60").unwrap().get("BTCUSDT").unwrap().signal.kind,
            SignalKind::Buy
        );
        assert_eq!(
            c.cache("240").unwrap().get("BTCUSDT").unwrap().signal.kind,
            SignalKind::Sell
        );
    }

    #[test]
    fn reuse_fresh_skips_fetches() {
        let (c, source) = confirmer(CachePolicy::ReuseFresh, &[]);
        let engine = scripted(SignalKind::Buy, SignalKind::Buy, SignalKind::Buy);
        let first = c.confirm(&engine, "BTCUSDT", "15", SignalKind::Buy);
        assert!(first.per_timeframe.iter().all(|v| !v.from_cache));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);

        let second = c.confirm(&engine, "BTCUSDT", "15", SignalKind::Buy);
        assert!(second.per_timeframe.iter().all(|v| v.from_cache));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(second.confirmations, 3);
    }

    #[test]
    fn always_recompute_refetches() {
        let (c, source) = confirmer(CachePolicy::AlwaysRecompute, &[]);
        let engine = scripted(SignalKind::Buy, SignalKind::Buy, SignalKind::Buy);
        c.confirm(&engine, "BTCUSDT", "15", SignalKind::Buy);
        c.confirm(&engine, "BTCUSDT", "15", SignalKind::Buy);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn policy_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&CachePolicy::ReuseFresh).unwrap(),
            "\"reuse_fresh\""
        );
        assert_eq!(CachePolicy::default(), CachePolicy::AlwaysRecompute);
    }
}
