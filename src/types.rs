// =============================================================================
// Shared types used across the stream and strategy layers
// =============================================================================

use serde::{Deserialize, Serialize};

/// Lifecycle of a single streaming session.
///
/// `Closing` is transient: `close()` always finishes in `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Degraded,
    Closing,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Authenticating => write!(f, "Authenticating"),
            Self::Connected => write!(f, "Connected"),
            Self::Degraded => write!(f, "Degraded"),
            Self::Closing => write!(f, "Closing"),
        }
    }
}

/// Directional verdict of a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Neutral,
    Buy,
    Sell,
    BuyWeak,
    SellWeak,
    ExitLong,
    ExitShort,
}

impl Default for SignalKind {
    fn default() -> Self {
        Self::Neutral
    }
}

impl SignalKind {
    /// Whether this is one of the two full-strength entry signals.
    pub fn is_entry(self) -> bool {
        matches!(self, Self::Buy | Self::Sell)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Neutral => write!(f, "neutral"),
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::BuyWeak => write!(f, "buy_weak"),
            Self::SellWeak => write!(f, "sell_weak"),
            Self::ExitLong => write!(f, "exit_long"),
            Self::ExitShort => write!(f, "exit_short"),
        }
    }
}

/// Stream families a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicCategory {
    Position,
    Execution,
    Order,
    Wallet,
    Ticker,
    Kline,
}

impl TopicCategory {
    /// Grammar name of the category.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Position => "position",
            Self::Execution => "execution",
            Self::Order => "order",
            Self::Wallet => "wallet",
            Self::Ticker => "ticker",
            Self::Kline => "kline",
        }
    }

    /// Account streams carry no symbol and require an authenticated session.
    pub fn is_private(self) -> bool {
        matches!(
            self,
            Self::Position | Self::Execution | Self::Order | Self::Wallet
        )
    }
}

impl std::fmt::Display for TopicCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
