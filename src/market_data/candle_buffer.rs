use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::stream::registry::Callback;
use crate::stream::topic::Topic;
use crate::types::TopicCategory;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV bar.  `timestamp` is the bar's start time in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub turnover: f64,
    #[serde(default = "default_closed")]
    pub is_closed: bool,
}

fn default_closed() -> bool {
    true
}

impl Candle {
    /// A closed bar without turnover.
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            turnover: 0.0,
            is_closed: true,
        }
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl CandleKey {
    pub fn new(symbol: &str, interval: &str) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            interval: interval.to_string(),
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Anything that can hand out a candle window.
///
/// Implementations may return bars in either order; consumers sort.
pub trait CandleSource: Send + Sync {
    fn get_candles(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>>;
}

// ---------------------------------------------------------------------------
// CandleBuffer -- thread-safe ring buffer per (symbol, interval)
// ---------------------------------------------------------------------------

/// Stores the most recent candles per `(symbol, interval)` pair.  The live
/// (unconfirmed) candle is updated in place; once confirmed it becomes
/// permanent and the ring is trimmed to `max_candles`.
pub struct CandleBuffer {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    max_candles: usize,
}

impl CandleBuffer {
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Insert or replace the latest candle for `key`.
    ///
    /// A bar with the same start time as the last stored bar replaces it
    /// unless the stored bar is already closed.  Out-of-order bars are
    /// dropped.
    pub fn update(&self, key: CandleKey, candle: Candle) {
        let mut map = self.buffers.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_candles + 1));

        if let Some(last) = ring.back() {
            if candle.timestamp < last.timestamp {
                debug!(ts = candle.timestamp, "dropping out-of-order candle");
                return;
            }
            if candle.timestamp == last.timestamp {
                if last.is_closed {
                    return;
                }
                ring.pop_back();
            }
        }
        ring.push_back(candle);

        while ring.len() > self.max_candles {
            ring.pop_front();
        }
    }

    /// Insert a batch of closed candles (e.g. a REST backfill), any order.
    pub fn extend(&self, key: &CandleKey, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.timestamp);
        for c in candles {
            self.update(key.clone(), c);
        }
    }

    /// Return the most recent `count` closed candles (oldest-first order).
    pub fn get_closed(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let closed: Vec<&Candle> = ring.iter().filter(|c| c.is_closed).collect();
                let start = closed.len().saturating_sub(count);
                closed[start..].iter().map(|c| (*c).clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Close price of the most recent closed candle, if any.
    pub fn last_close(&self, key: &CandleKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.iter().rev().find(|c| c.is_closed).map(|c| c.close))
    }

    /// Number of candles (including an in-progress one) stored for `key`.
    pub fn count(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
    }
}

impl CandleSource for CandleBuffer {
    fn get_candles(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        Ok(self.get_closed(&CandleKey::new(symbol, interval), limit))
    }
}

// ---------------------------------------------------------------------------
// Kline frames
// ---------------------------------------------------------------------------

/// Parse the `data` array of a kline push frame.
///
/// Expected shape:
/// ```json
/// [{ "start": 1672324800000, "end": 1672325099999, "interval": "5",
///    "open": "16649.5", "close": "16677", "high": "16677", "low": "16608",
///    "volume": "2.081", "turnover": "34666.4005", "confirm": false }]
/// ```
pub fn parse_kline_payload(topic: &Topic, payload: &Value) -> Result<Vec<(CandleKey, Candle)>> {
    let symbol = topic
        .symbol
        .as_deref()
        .context("kline topic without symbol")?;
    let topic_interval = topic
        .interval
        .as_deref()
        .context("kline topic without interval")?;

    let bars = payload.as_array().context("kline payload is not an array")?;
    let mut out = Vec::with_capacity(bars.len());

    for bar in bars {
        let interval = bar["interval"].as_str().unwrap_or(topic_interval);
        let candle = Candle {
            timestamp: bar["start"].as_i64().context("missing field start")?,
            open: parse_string_f64(&bar["open"], "open")?,
            high: parse_string_f64(&bar["high"], "high")?,
            low: parse_string_f64(&bar["low"], "low")?,
            close: parse_string_f64(&bar["close"], "close")?,
            volume: parse_string_f64(&bar["volume"], "volume")?,
            turnover: parse_string_f64(&bar["turnover"], "turnover").unwrap_or(0.0),
            is_closed: bar["confirm"].as_bool().unwrap_or(false),
        };
        out.push((CandleKey::new(symbol, interval), candle));
    }

    Ok(out)
}

/// Numeric values arrive as JSON strings; accept plain numbers too.
pub fn parse_string_f64(val: &Value, name: &str) -> Result<f64> {
    match val {
        Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Topic callback that feeds kline frames into `buffer`.
///
/// `on_close` runs after a bar is confirmed, with the bar's series key.
pub fn kline_callback(
    buffer: Arc<CandleBuffer>,
    on_close: Option<Arc<dyn Fn(&CandleKey) + Send + Sync>>,
) -> Callback {
    Arc::new(move |topic: &Topic, payload: &Value| {
        if topic.category != TopicCategory::Kline {
            return;
        }
        match parse_kline_payload(topic, payload) {
            Ok(bars) => {
                for (key, candle) in bars {
                    let closed = candle.is_closed;
                    debug!(key = %key, close = candle.close, closed, "candle update");
                    buffer.update(key.clone(), candle);
                    if closed {
                        if let Some(cb) = &on_close {
                            cb(&key);
                        }
                    }
                }
            }
            Err(e) => warn!(topic = %topic, error = %e, "failed to parse kline frame"),
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
