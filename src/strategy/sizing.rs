// =============================================================================
// Position Sizing — fixed risk per trade
// =============================================================================
//
//   risk_per_unit = |entry - stop|
//   size          = risk_amount / risk_per_unit
//   size          = min(size, account * max_risk_pct / 100 / risk_per_unit)
//
// Sizes are rounded to a lot precision that shrinks as price grows:
//   price < 1     -> 3 decimals
//   price < 10    -> 2 decimals
//   price < 1000  -> 1 decimal
//   otherwise     -> whole units

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// A sized order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSize {
    pub position_size: f64,
    pub risk_per_unit: f64,
    pub actual_risk_amount: f64,
    /// Share of the account at risk, when an account size was given.
    pub risk_percent: Option<f64>,
    /// Account-derived risk ceiling, when an account size was given.
    pub max_risk_amount: Option<f64>,
    pub entry_price: f64,
    pub stop_loss: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("position sizing rejected: {reason}")]
pub struct SizingRejection {
    pub reason: String,
}

impl SizingRejection {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Decimal places for a position in an asset trading at `price`.
pub fn size_precision(price: f64) -> i32 {
    if price < 1.0 {
        3
    } else if price < 10.0 {
        2
    } else if price < 1000.0 {
        1
    } else {
        0
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Size a position so that hitting `stop_loss` loses about `risk_amount`.
pub fn calculate_position_size(
    price: f64,
    stop_loss: f64,
    risk_amount: f64,
    account_size: Option<f64>,
    max_risk_percent: f64,
) -> Result<PositionSize, SizingRejection> {
    if !(price.is_finite() && price > 0.0) {
        return Err(SizingRejection::new(format!("invalid entry price {price}")));
    }
    if !stop_loss.is_finite() {
        return Err(SizingRejection::new("invalid stop loss"));
    }
    if !(risk_amount.is_finite() && risk_amount > 0.0) {
        return Err(SizingRejection::new(format!("invalid risk amount {risk_amount}")));
    }

    let risk_per_unit = (price - stop_loss).abs();
    if risk_per_unit == 0.0 {
        return Err(SizingRejection::new("stop loss equals entry price"));
    }

    let mut size = risk_amount / risk_per_unit;

    let max_risk_amount = account_size.map(|account| account * (max_risk_percent / 100.0));
    if let Some(max_risk) = max_risk_amount {
        let cap = max_risk / risk_per_unit;
        if cap < size {
            debug!(size, cap, "position capped by account risk limit");
            size = cap;
        }
    }

    let size = round_to(size, size_precision(price));
    if size <= 0.0 {
        return Err(SizingRejection::new("position size too small after rounding"));
    }

    let actual_risk_amount = size * risk_per_unit;
    let risk_percent = account_size
        .filter(|a| *a > 0.0)
        .map(|a| actual_risk_amount / a * 100.0);

    Ok(PositionSize {
        position_size: size,
        risk_per_unit,
        actual_risk_amount,
        risk_percent,
        max_risk_amount,
        entry_price: price,
        stop_loss,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_risk_budget() {
        let p = calculate_position_size(100.0, 95.0, 500.0, None, 1.0).unwrap();
        assert!((p.risk_per_unit - 5.0).abs() < 1e-9);
        assert!((p.position_size - 100.0).abs() < 1e-9);
        assert!((p.actual_risk_amount - 500.0).abs() < 1e-9);
        assert_eq!(p.risk_percent, None);
        assert_eq!(p.max_risk_amount, None);
    }

    #[test]
    fn account_cap_applies() {
        let p = calculate_position_size(100.0, 95.0, 500.0, Some(1000.0), 1.0).unwrap();
        assert!((p.max_risk_amount.unwrap() - 10.0).abs() < 1e-9);
        assert!((p.position_size - 2.0).abs() < 1e-9);
        assert!((p.actual_risk_amount - 10.0).abs() < 1e-9);
        assert!((p.risk_percent.unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn short_side_uses_distance() {
        let p = calculate_position_size(100.0, 105.0, 500.0, None, 1.0).unwrap();
        assert!((p.position_size - 100.0).abs() < 1e-9);
    }

    #[test]
    fn zero_distance_is_rejected() {
        let err = calculate_position_size(100.0, 100.0, 500.0, None, 1.0).unwrap_err();
        assert!(err.reason.contains("stop"));
    }

    #[test]
    fn tiny_size_is_rejected() {
        // 1 / 1000 = 0.001 units of a $5000 asset rounds to zero.
        let err = calculate_position_size(5000.0, 4000.0, 1.0, None, 1.0).unwrap_err();
        assert!(err.reason.contains("too small"));
    }

    #[test]
    fn precision_follows_price() {
        assert_eq!(size_precision(0.5), 3);
        assert_eq!(size_precision(5.0), 2);
        assert_eq!(size_precision(500.0), 1);
        assert_eq!(size_precision(50_000.0), 0);

        let p = calculate_position_size(0.5, 0.45, 10.0, None, 1.0).unwrap();
        assert!((p.position_size - 200.0).abs() < 1e-9);
        let p = calculate_position_size(50_000.0, 49_000.0, 2_500.0, None, 1.0).unwrap();
        assert!((p.position_size - 3.0).abs() < 1e-9);
        let p = calculate_position_size(3.0, 2.9, 1.2346, None, 1.0).unwrap();
        assert!((p.position_size - 12.35).abs() < 1e-9);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(calculate_position_size(0.0, 1.0, 10.0, None, 1.0).is_err());
        assert!(calculate_position_size(f64::NAN, 1.0, 10.0, None, 1.0).is_err());
        assert!(calculate_position_size(10.0, 9.0, -5.0, None, 1.0).is_err());
    }
}
