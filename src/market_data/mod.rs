pub mod candle_buffer;

// Re-export the Candle struct for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle_buffer::{kline_callback, Candle, CandleBuffer, CandleKey, CandleSource};
