// =============================================================================
// Strategy Engine — candle window -> indicators -> signal
// =============================================================================
//
// A strategy is two pure steps behind the `StrategyEngine` trait.  `analyze`
// owns everything around them: the minimum-history gate, sorting, error
// downgrading, caching, and timing.

pub mod cache;
pub mod channel_breakout;
pub mod confirmation;
pub mod indicator_set;
pub mod signal;
pub mod sizing;

pub use cache::{SignalCache, SymbolState};
pub use channel_breakout::ChannelBreakout;
pub use confirmation::{CachePolicy, ConfirmationResult, MultiTimeframeConfirmer};
pub use indicator_set::{IndicatorSet, IndicatorValue};
pub use signal::{AnalysisRecord, Signal, SignalLevels};
pub use sizing::{calculate_position_size, PositionSize, SizingRejection};

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::market_data::Candle;

/// History a strategy needs unless it says otherwise.
pub const DEFAULT_MIN_CANDLES: usize = 20;

/// A signal-generating strategy.
///
/// Both hooks receive a window sorted ascending by timestamp.
pub trait StrategyEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Interval the strategy is tuned for, in venue notation ("15", "60", "D").
    fn timeframe(&self) -> &str;

    /// Tunable parameters, for logs and records.
    fn parameters(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn min_required_candles(&self) -> usize {
        DEFAULT_MIN_CANDLES
    }

    /// Never called with fewer than `min_required_candles()` bars.
    fn compute_indicators(&self, window: &[Candle]) -> Result<IndicatorSet>;

    fn generate_signal(&self, window: &[Candle], indicators: &IndicatorSet) -> Result<Signal>;
}

/// Run `engine` over `window` and cache the outcome under `symbol`.
///
/// Short or empty windows produce a neutral record without touching the
/// strategy or the cache.  Errors from either hook become a neutral signal
/// carrying the error text.
pub fn analyze(
    engine: &dyn StrategyEngine,
    cache: &SignalCache,
    window: &[Candle],
    symbol: &str,
) -> AnalysisRecord {
    let started = Instant::now();
    let record = |signal: Signal, indicators: Option<IndicatorSet>| AnalysisRecord {
        symbol: symbol.to_string(),
        strategy: engine.name().to_string(),
        timeframe: engine.timeframe().to_string(),
        signal,
        indicators,
        candles: window.len(),
        timestamp: Utc::now(),
    };

    // ── 1. History gate ──
    let needed = engine.min_required_candles();
    if window.is_empty() {
        warn!(symbol, strategy = engine.name(), "empty candle window, no analysis possible");
        return record(Signal::neutral("no candle data"), None);
    }
    if window.len() < needed {
        warn!(
            symbol,
            strategy = engine.name(),
            have = window.len(),
            need = needed,
            "insufficient candle history"
        );
        return record(
            Signal::neutral(format!(
                "insufficient data: {} candles, {} required",
                window.len(),
                needed
            )),
            None,
        );
    }

    // ── 2. Ascending private copy ──
    let window: Cow<'_, [Candle]> = if window.windows(2).all(|w| w[0].timestamp <= w[1].timestamp) {
        Cow::Borrowed(window)
    } else {
        let mut sorted = window.to_vec();
        sorted.sort_by_key(|c| c.timestamp);
        Cow::Owned(sorted)
    };

    // ── 3. Indicators ──
    let indicators = match engine.compute_indicators(&window) {
        Ok(set) => set,
        Err(e) => {
            warn!(symbol, strategy = engine.name(), error = %e, "indicator computation failed");
            return record(
                Signal::neutral(format!("indicator computation failed: {e:#}")),
                None,
            );
        }
    };
    if let Some(name) = indicators.oversized_series(window.len()) {
        warn!(symbol, indicator = name, "indicator series longer than candle window");
        return record(
            Signal::neutral(format!("indicator {name} longer than candle window")),
            Some(indicators),
        );
    }

    // ── 4. Signal ──
    let signal = match engine.generate_signal(&window, &indicators) {
        Ok(signal) => signal,
        Err(e) => {
            warn!(symbol, strategy = engine.name(), error = %e, "signal generation failed");
            return record(
                Signal::neutral(format!("signal generation failed: {e:#}")),
                Some(indicators),
            );
        }
    };

    // ── 5. Cache ──
    cache.put(symbol, indicators.clone(), signal.clone());

    info!(
        symbol,
        strategy = engine.name(),
        timeframe = engine.timeframe(),
        signal = %signal.kind,
        strength = signal.strength,
        "analysis complete"
    );
    debug!(
        symbol,
        elapsed_us = started.elapsed().as_micros() as u64,
        "analysis timing"
    );

    record(signal, Some(indicators))
}

/// A strategy bound to its cache.
#[derive(Clone)]
pub struct Analyzer {
    engine: Arc<dyn StrategyEngine>,
    cache: Arc<SignalCache>,
}

impl Analyzer {
    pub fn new(engine: Arc<dyn StrategyEngine>) -> Self {
        Self {
            engine,
            cache: Arc::new(SignalCache::new()),
        }
    }

    pub fn engine(&self) -> &dyn StrategyEngine {
        self.engine.as_ref()
    }

    pub fn cache(&self) -> &Arc<SignalCache> {
        &self.cache
    }

    pub fn analyze(&self, window: &[Candle], symbol: &str) -> AnalysisRecord {
        analyze(self.engine.as_ref(), &self.cache, window, symbol)
    }
}
