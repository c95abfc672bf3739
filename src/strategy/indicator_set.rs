use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single named indicator output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndicatorValue {
    Scalar(f64),
    /// Aligned with the candle window; `None` where history is too short.
    Series(Vec<Option<f64>>),
}

impl IndicatorValue {
    pub fn latest(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => v.is_finite().then_some(*v),
            Self::Series(s) => s.last().copied().flatten(),
        }
    }

    /// Value one bar before the latest.  Scalars have no history.
    pub fn previous(&self) -> Option<f64> {
        match self {
            Self::Scalar(_) => None,
            Self::Series(s) => s.len().checked_sub(2).and_then(|i| s[i]),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Scalar(_) => 1,
            Self::Series(s) => s.len(),
        }
    }
}

/// Named indicator outputs of one strategy run.
///
/// A series' latest value is always its last element, so scalar views never
/// drift from the series they summarise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndicatorSet {
    values: BTreeMap<String, IndicatorValue>,
}

impl IndicatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_scalar(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), IndicatorValue::Scalar(value));
    }

    pub fn insert_flag(&mut self, name: impl Into<String>, flag: bool) {
        self.insert_scalar(name, if flag { 1.0 } else { 0.0 });
    }

    pub fn insert_series(&mut self, name: impl Into<String>, series: Vec<Option<f64>>) {
        self.values.insert(name.into(), IndicatorValue::Series(series));
    }

    pub fn get(&self, name: &str) -> Option<&IndicatorValue> {
        self.values.get(name)
    }

    pub fn latest(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(IndicatorValue::latest)
    }

    pub fn previous(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(IndicatorValue::previous)
    }

    /// A flag is set when its latest value is positive.
    pub fn flag(&self, name: &str) -> bool {
        self.latest(name).is_some_and(|v| v > 0.0)
    }

    pub fn series(&self, name: &str) -> Option<&[Option<f64>]> {
        match self.values.get(name)? {
            IndicatorValue::Series(s) => Some(s),
            IndicatorValue::Scalar(_) => None,
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Name of the first series longer than a window of `window_len` bars.
    pub fn oversized_series(&self, window_len: usize) -> Option<&str> {
        self.values
            .iter()
            .find(|(_, v)| v.len() > window_len)
            .map(|(k, _)| k.as_str())
    }
}
