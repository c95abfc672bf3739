use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::strategy::indicator_set::IndicatorSet;
use crate::types::SignalKind;

/// Protective levels attached to entry signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalLevels {
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// Output of a strategy's signal step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    /// Always within `[0.0, 1.0]`.
    pub strength: f64,
    pub reason: String,
    #[serde(default)]
    pub levels: SignalLevels,
    /// Numeric context for loggers (price, bounds, ratios).
    #[serde(default)]
    pub details: BTreeMap<String, f64>,
}

impl Signal {
    /// Build a signal, clamping `strength` into `[0, 1]` (NaN becomes 0).
    pub fn new(kind: SignalKind, strength: f64, reason: impl Into<String>) -> Self {
        let strength = if strength.is_nan() {
            0.0
        } else {
            strength.clamp(0.0, 1.0)
        };
        Self {
            kind,
            strength,
            reason: reason.into(),
            levels: SignalLevels::default(),
            details: BTreeMap::new(),
        }
    }

    pub fn neutral(reason: impl Into<String>) -> Self {
        Self::new(SignalKind::Neutral, 0.0, reason)
    }

    pub fn with_levels(mut self, levels: SignalLevels) -> Self {
        self.levels = levels;
        self
    }

    pub fn with_detail(mut self, name: &str, value: f64) -> Self {
        if value.is_finite() {
            self.details.insert(name.to_string(), value);
        }
        self
    }
}

/// Timestamped result of one `analyze` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub symbol: String,
    pub strategy: String,
    pub timeframe: String,
    pub signal: Signal,
    /// `None` when indicators were never computed.
    pub indicators: Option<IndicatorSet>,
    pub candles: usize,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strength_is_clamped() {
        assert_eq!(Signal::new(SignalKind::Buy, 1.7, "x").strength, 1.0);
        assert_eq!(Signal::new(SignalKind::Sell, -0.2, "x").strength, 0.0);
        assert_eq!(Signal::new(SignalKind::Buy, f64::NAN, "x").strength, 0.0);
        assert_eq!(Signal::new(SignalKind::Buy, 0.42, "x").strength, 0.42);
    }

    #[test]
    fn non_finite_details_are_skipped() {
        let s = Signal::neutral("quiet")
            .with_detail("atr", 1.0)
            .with_detail("roc", f64::INFINITY);
        assert_eq!(s.details.len(), 1);
        assert_eq!(s.kind, SignalKind::Neutral);
        assert_eq!(s.strength, 0.0);
    }
}
