// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators used by the
// strategies.  Series are aligned with their input (one `Option<f64>` per
// bar) so that the latest value is always the last element.

pub mod atr;
pub mod roc;
pub mod rolling;
pub mod volatility;
