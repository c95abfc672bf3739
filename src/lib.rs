// =============================================================================
// Bybit Sentinel — resilient market data streaming and strategy analysis
// =============================================================================

pub mod error;
pub mod exchange;
pub mod indicators;
pub mod market_data;
pub mod runtime_config;
pub mod strategy;
pub mod stream;
pub mod types;
