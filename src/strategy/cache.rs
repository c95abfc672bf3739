// =============================================================================
// Signal Cache — last analysis per symbol, staleness checked on read
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::strategy::indicator_set::IndicatorSet;
use crate::strategy::signal::Signal;

/// Most recent analysis of one symbol.
#[derive(Debug, Clone)]
pub struct SymbolState {
    pub symbol: String,
    pub indicators: IndicatorSet,
    pub signal: Signal,
    pub last_update: DateTime<Utc>,
}

impl SymbolState {
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.last_update
    }
}

/// Per-symbol store of the latest indicators and signal.
///
/// Entries are replaced whole, so a reader sees either the old or the new
/// state of a symbol and never a mix.  Nothing expires on its own.
#[derive(Default)]
pub struct SignalCache {
    entries: RwLock<HashMap<String, Arc<SymbolState>>>,
}

impl SignalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<SymbolState>> {
        self.entries.read().get(symbol).cloned()
    }

    /// Overwrite the state of `symbol`.
    pub fn put(&self, symbol: &str, indicators: IndicatorSet, signal: Signal) -> Arc<SymbolState> {
        self.put_at(symbol, indicators, signal, Utc::now())
    }

    pub(crate) fn put_at(
        &self,
        symbol: &str,
        indicators: IndicatorSet,
        signal: Signal,
        at: DateTime<Utc>,
    ) -> Arc<SymbolState> {
        let state = Arc::new(SymbolState {
            symbol: symbol.to_string(),
            indicators,
            signal,
            last_update: at,
        });
        self.entries.write().insert(symbol.to_string(), state.clone());
        state
    }

    /// True when `symbol` has no entry or its entry is at least `max_age` old.
    pub fn should_refresh(&self, symbol: &str, max_age: Duration) -> bool {
        let Some(state) = self.get(symbol) else {
            return true;
        };
        match chrono::Duration::from_std(max_age) {
            Ok(max) => state.age() >= max,
            // Beyond chrono's range: never stale.
            Err(_) => false,
        }
    }

    /// Evict one symbol, or everything when `symbol` is `None`.
    pub fn clear(&self, symbol: Option<&str>) {
        let mut entries = self.entries.write();
        match symbol {
            Some(s) => {
                entries.remove(s);
                debug!(symbol = s, "signal cache entry cleared");
            }
            None => {
                entries.clear();
                debug!("signal cache cleared");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
