// =============================================================================
// Runtime Configuration — Connection, strategy and confirmation settings
// =============================================================================
//
// Every tunable parameter of the sentinel lives here.  All fields carry a
// serde default so that an older config file (or `{}`) always loads.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::strategy::confirmation::CachePolicy;

const MAINNET_PRIVATE_WS: &str = "wss://stream.bybit.com/v5/private";
const TESTNET_PRIVATE_WS: &str = "wss://stream-testnet.bybit.com/v5/private";
const MAINNET_PUBLIC_WS: &str = "wss://stream.bybit.com/v5/public/linear";
const TESTNET_PUBLIC_WS: &str = "wss://stream-testnet.bybit.com/v5/public/linear";
const MAINNET_REST: &str = "https://api.bybit.com";
const TESTNET_REST: &str = "https://api-testnet.bybit.com";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_auth_path() -> String {
    "/realtime".to_string()
}

fn default_auth_expiry_ms() -> i64 {
    10_000
}

fn default_monitor_interval_secs() -> u64 {
    10
}

fn default_reconnect_interval_secs() -> u64 {
    30
}

fn default_heartbeat_interval_secs() -> u64 {
    20
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_topics() -> Vec<String> {
    vec![
        "position".to_string(),
        "execution".to_string(),
        "order".to_string(),
        "wallet".to_string(),
    ]
}

fn default_kline_interval() -> String {
    "15".to_string()
}

fn default_period() -> usize {
    20
}

fn default_exit_period() -> usize {
    10
}

fn default_atr_period() -> usize {
    14
}

fn default_atr_multiplier() -> f64 {
    2.0
}

fn default_volume_threshold() -> f64 {
    1.5
}

fn default_ladder() -> Vec<String> {
    vec![
        "15".to_string(),
        "60".to_string(),
        "240".to_string(),
        "D".to_string(),
    ]
}

fn default_max_signal_age_secs() -> u64 {
    300
}

fn default_candle_limit() -> usize {
    200
}

fn default_risk_amount() -> f64 {
    50.0
}

fn default_max_risk_percent() -> f64 {
    1.0
}

// =============================================================================
// ConnectionParams
// =============================================================================

/// Streaming session and watchdog timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Use the venue's testnet endpoints.
    #[serde(default)]
    pub testnet: bool,

    /// Explicit websocket endpoint; derived from `testnet` when absent.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Path component of the signed auth payload.
    #[serde(default = "default_auth_path")]
    pub auth_path: String,

    /// How long a generated signature stays valid.
    #[serde(default = "default_auth_expiry_ms")]
    pub auth_expiry_ms: i64,

    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// Sleep after a failed reconnect; doubled once failures escalate.
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Bound on every acknowledgement wait (subscribe, unsubscribe).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ConnectionParams {
    /// Websocket endpoint to dial.
    pub fn endpoint(&self) -> String {
        match &self.endpoint {
            Some(url) => url.clone(),
            None if self.testnet => TESTNET_PRIVATE_WS.to_string(),
            None => MAINNET_PRIVATE_WS.to_string(),
        }
    }

    /// Public linear-market stream for klines and tickers.
    pub fn public_endpoint(&self) -> &'static str {
        if self.testnet {
            TESTNET_PUBLIC_WS
        } else {
            MAINNET_PUBLIC_WS
        }
    }

    /// REST base URL matching the websocket network.
    pub fn rest_base_url(&self) -> &'static str {
        if self.testnet {
            TESTNET_REST
        } else {
            MAINNET_REST
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            testnet: false,
            endpoint: None,
            auth_path: default_auth_path(),
            auth_expiry_ms: default_auth_expiry_ms(),
            monitor_interval_secs: default_monitor_interval_secs(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// =============================================================================
// ChannelBreakoutParams
// =============================================================================

/// Tunable parameters for the channel breakout strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelBreakoutParams {
    /// Entry channel lookback.
    #[serde(default = "default_period")]
    pub period: usize,

    /// Exit channel lookback (shorter than `period`).
    #[serde(default = "default_exit_period")]
    pub exit_period: usize,

    #[serde(default = "default_atr_period")]
    pub atr_period: usize,

    /// ATR multiple used for the stop distance.
    #[serde(default = "default_atr_multiplier")]
    pub atr_multiplier: f64,

    /// Minimum volume ratio for a breakout to count.
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: f64,

    /// Interval the strategy is designed for.
    #[serde(default = "default_kline_interval")]
    pub timeframe: String,
}

impl Default for ChannelBreakoutParams {
    fn default() -> Self {
        Self {
            period: default_period(),
            exit_period: default_exit_period(),
            atr_period: default_atr_period(),
            atr_multiplier: default_atr_multiplier(),
            volume_threshold: default_volume_threshold(),
            timeframe: default_kline_interval(),
        }
    }
}

// =============================================================================
// ConfirmationParams / SizingParams
// =============================================================================

/// Multi-timeframe confirmation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationParams {
    /// Timeframes ordered finest to coarsest.
    #[serde(default = "default_ladder")]
    pub ladder: Vec<String>,

    #[serde(default)]
    pub cache_policy: CachePolicy,

    /// Age after which a cached signal is recomputed under `reuse_fresh`.
    #[serde(default = "default_max_signal_age_secs")]
    pub max_signal_age_secs: u64,

    /// Number of candles requested per timeframe.
    #[serde(default = "default_candle_limit")]
    pub candle_limit: usize,
}

impl ConfirmationParams {
    pub fn max_signal_age(&self) -> Duration {
        Duration::from_secs(self.max_signal_age_secs)
    }
}

impl Default for ConfirmationParams {
    fn default() -> Self {
        Self {
            ladder: default_ladder(),
            cache_policy: CachePolicy::default(),
            max_signal_age_secs: default_max_signal_age_secs(),
            candle_limit: default_candle_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingParams {
    /// Quote-currency amount risked per trade.
    #[serde(default = "default_risk_amount")]
    pub risk_amount: f64,

    /// When set, caps the risk at `max_risk_percent` of this balance.
    #[serde(default)]
    pub account_size: Option<f64>,

    #[serde(default = "default_max_risk_percent")]
    pub max_risk_percent: f64,
}

impl Default for SizingParams {
    fn default() -> Self {
        Self {
            risk_amount: default_risk_amount(),
            account_size: None,
            max_risk_percent: default_max_risk_percent(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub connection: ConnectionParams,

    /// Symbols analysed and streamed as klines.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Extra topics subscribed at startup, in topic grammar.
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    /// Kline interval streamed for every symbol.
    #[serde(default = "default_kline_interval")]
    pub kline_interval: String,

    #[serde(default)]
    pub channel_breakout: ChannelBreakoutParams,

    #[serde(default)]
    pub confirmation: ConfirmationParams,

    #[serde(default)]
    pub sizing: SizingParams,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionParams::default(),
            symbols: default_symbols(),
            topics: default_topics(),
            kline_interval: default_kline_interval(),
            channel_breakout: ChannelBreakoutParams::default(),
            confirmation: ConfirmationParams::default(),
            sizing: SizingParams::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            testnet = config.connection.testnet,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `SENTINEL_SYMBOLS` / `BYBIT_TESTNET` overrides from the
    /// environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("SENTINEL_SYMBOLS") {
            let parsed = parse_symbol_list(&syms);
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }
        if let Ok(flag) = std::env::var("BYBIT_TESTNET") {
            self.connection.testnet = matches!(flag.trim(), "1" | "true" | "TRUE" | "yes");
        }
    }
}

/// Split a comma separated symbol list, upper-casing and dropping blanks.
pub fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}
