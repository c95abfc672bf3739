// =============================================================================
// Topic — Parsed stream identifier
// =============================================================================
//
// Grammar (dotted, bit-exact):
//   position | execution | order | wallet
//   ticker.<SYMBOL>
//   kline.<INTERVAL>.<SYMBOL>
//
// Symbols are upper-cased on parse, matching how the venue names them on
// inbound frames.  The canonical key (the `Display` form) is what the
// registry indexes callbacks by, and re-parsing it yields the same topic.  The venue names the ticker stream `tickers.<SYMBOL>`, so the
// wire form differs from the key for that one category.
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TopicParseError;
use crate::types::TopicCategory;

/// A parsed subscription topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub category: TopicCategory,
    pub symbol: Option<String>,
    pub interval: Option<String>,
}

impl Topic {
    /// Account-wide stream with no symbol.
    pub fn private(category: TopicCategory) -> Self {
        Self {
            category,
            symbol: None,
            interval: None,
        }
    }

    pub fn ticker(symbol: &str) -> Self {
        Self {
            category: TopicCategory::Ticker,
            symbol: Some(symbol.to_uppercase()),
            interval: None,
        }
    }

    pub fn kline(interval: &str, symbol: &str) -> Self {
        Self {
            category: TopicCategory::Kline,
            symbol: Some(symbol.to_uppercase()),
            interval: Some(interval.to_string()),
        }
    }

    /// Topic name as sent in subscribe/unsubscribe requests.
    pub fn venue_topic(&self) -> String {
        match self.category {
            TopicCategory::Ticker => format!("tickers.{}", self.symbol.as_deref().unwrap_or("")),
            _ => self.to_string(),
        }
    }

    /// Classify a topic string as reported by the venue on inbound frames.
    ///
    /// Trailing segments beyond the grammar (e.g. `order.linear`) are ignored
    /// so that the frame still routes to the canonical key.
    pub fn from_venue(raw: &str) -> Result<Self, TopicParseError> {
        let parts: Vec<&str> = raw.split('.').collect();
        let head = parts.first().copied().unwrap_or("");
        if head.is_empty() {
            return Err(TopicParseError::Empty);
        }

        let category = match head {
            "tickers" | "ticker" => TopicCategory::Ticker,
            other => parse_category(other)?,
        };

        match category {
            TopicCategory::Ticker => match parts.get(1) {
                Some(sym) if !sym.is_empty() => Ok(Self::ticker(sym)),
                _ => Err(TopicParseError::Malformed(raw.to_string())),
            },
            TopicCategory::Kline => match (parts.get(1), parts.get(2)) {
                (Some(iv), Some(sym)) if !iv.is_empty() && !sym.is_empty() => {
                    Ok(Self::kline(iv, sym))
                }
                _ => Err(TopicParseError::Malformed(raw.to_string())),
            },
            private => Ok(Self::private(private)),
        }
    }
}

fn parse_category(s: &str) -> Result<TopicCategory, TopicParseError> {
    match s {
        "position" => Ok(TopicCategory::Position),
        "execution" => Ok(TopicCategory::Execution),
        "order" => Ok(TopicCategory::Order),
        "wallet" => Ok(TopicCategory::Wallet),
        "ticker" => Ok(TopicCategory::Ticker),
        "kline" => Ok(TopicCategory::Kline),
        other => Err(TopicParseError::UnknownCategory(other.to_string())),
    }
}

impl FromStr for Topic {
    type Err = TopicParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TopicParseError::Empty);
        }

        let parts: Vec<&str> = raw.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(TopicParseError::Malformed(raw.to_string()));
        }

        let category = parse_category(parts[0])?;
        let malformed = || TopicParseError::Malformed(raw.to_string());

        match (category, parts.len()) {
            (TopicCategory::Ticker, 2) => Ok(Self::ticker(parts[1])),
            (TopicCategory::Kline, 3) => Ok(Self::kline(parts[1], parts[2])),
            (TopicCategory::Ticker | TopicCategory::Kline, _) => Err(malformed()),
            (private, 1) => Ok(Self::private(private)),
            _ => Err(malformed()),
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.category.as_str())?;
        if let Some(iv) = &self.interval {
            write!(f, ".{iv}")?;
        }
        if let Some(sym) = &self.symbol {
            write!(f, ".{sym}")?;
        }
        Ok(())
    }
}
