// =============================================================================
// Rate-Limit Tracker — reads Bybit's per-endpoint limit headers
// =============================================================================
//
// Every v5 REST response carries:
//   X-Bapi-Limit                  requests allowed in the current window
//   X-Bapi-Limit-Status           requests remaining in the current window
//   X-Bapi-Limit-Reset-Timestamp  ms timestamp at which the window resets
//
// The tracker keeps the latest values in atomics so any thread may query them
// lock-free.  Until a header has been seen the budget counts as unknown and
// requests are allowed.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Remaining requests at which we stop sending until the window resets.
const REMAINING_RESERVE: i64 = 2;
/// Remaining requests at which we start warning.
const REMAINING_WARN: i64 = 10;

const UNKNOWN: i64 = -1;

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    limit: AtomicI64,
    remaining: AtomicI64,
    reset_at_ms: AtomicI64,
}

/// Serialisable view of the current rate-limit state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub reset_at_ms: Option<i64>,
}

fn known(v: i64) -> Option<i64> {
    (v != UNKNOWN).then_some(v)
}

fn header_i64(headers: &reqwest::header::HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            limit: AtomicI64::new(UNKNOWN),
            remaining: AtomicI64::new(UNKNOWN),
            reset_at_ms: AtomicI64::new(UNKNOWN),
        }
    }

    // -------------------------------------------------------------------------
    // Header-based updates
    // -------------------------------------------------------------------------

    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(limit) = header_i64(headers, "X-Bapi-Limit") {
            self.limit.store(limit, Ordering::Relaxed);
        }
        if let Some(reset) = header_i64(headers, "X-Bapi-Limit-Reset-Timestamp") {
            self.reset_at_ms.store(reset, Ordering::Relaxed);
        }
        if let Some(remaining) = header_i64(headers, "X-Bapi-Limit-Status") {
            let prev = self.remaining.swap(remaining, Ordering::Relaxed);
            if remaining <= REMAINING_WARN && (prev == UNKNOWN || prev > REMAINING_WARN) {
                warn!(
                    remaining,
                    limit = self.limit.load(Ordering::Relaxed),
                    "rate-limit budget crossed warning threshold"
                );
            }
            debug!(remaining, "rate-limit budget updated from header");
        }
    }

    // -------------------------------------------------------------------------
    // Pre-flight check
    // -------------------------------------------------------------------------

    /// Whether another request fits the budget at `now_ms`.
    pub fn can_send_request(&self, now_ms: i64) -> bool {
        let remaining = self.remaining.load(Ordering::Relaxed);
        if remaining == UNKNOWN || remaining > REMAINING_RESERVE {
            return true;
        }
        let reset_at = self.reset_at_ms.load(Ordering::Relaxed);
        if reset_at != UNKNOWN && now_ms >= reset_at {
            return true;
        }
        warn!(remaining, reset_at_ms = reset_at, "request blocked, rate-limit budget exhausted");
        false
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            limit: known(self.limit.load(Ordering::Relaxed)),
            remaining: known(self.remaining.load(Ordering::Relaxed)),
            reset_at_ms: known(self.reset_at_ms.load(Ordering::Relaxed)),
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("limit", &self.limit.load(Ordering::Relaxed))
            .field("remaining", &self.remaining.load(Ordering::Relaxed))
            .field("reset_at_ms", &self.reset_at_ms.load(Ordering::Relaxed))
            .finish()
    }
}
