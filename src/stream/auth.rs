// =============================================================================
// Stream Authentication — HMAC-SHA256 signed, time-boxed credentials
// =============================================================================
//
// The venue authenticates a private stream with
//
//   signature = hex(HMAC_SHA256(secret, "GET" + path + expires))
//
// where `expires` is a millisecond timestamp on the venue's clock.  The local
// clock is corrected by an externally calibrated offset, and the signature is
// only valid until `expires`: a handshake that completes later is treated as
// an authentication failure.
//
// SECURITY: the secret is never logged or serialised.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};

use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tracing::{info, warn};

use crate::error::ConnectionError;

type HmacSha256 = Hmac<Sha256>;

/// Offsets beyond this are reported; signatures may start failing.
const OFFSET_WARN_MS: i64 = 5_000;

/// Current UNIX time in milliseconds on the local clock.
pub fn local_now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Produce an HMAC-SHA256 hex signature of `payload` keyed by `secret`.
pub fn sign(payload: &str, secret: &str) -> Result<String, ConnectionError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ConnectionError::Authentication(format!("unusable secret: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// The string the venue expects to be signed.
pub fn auth_payload(path: &str, expires_ms: i64) -> String {
    format!("GET{path}{expires_ms}")
}

// -----------------------------------------------------------------------------
// Clock offset
// -----------------------------------------------------------------------------

/// Venue clock minus local clock, in milliseconds.
///
/// Shared between the REST collaborator that measures it and the connection
/// that signs with it.
#[derive(Debug, Default)]
pub struct ClockOffset {
    offset_ms: AtomicI64,
}

impl ClockOffset {
    pub fn new(offset_ms: i64) -> Self {
        Self {
            offset_ms: AtomicI64::new(offset_ms),
        }
    }

    pub fn get(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Record `server_ms - local_ms` and return it.
    pub fn calibrate(&self, server_ms: i64, local_ms: i64) -> i64 {
        let offset = server_ms - local_ms;
        self.offset_ms.store(offset, Ordering::Relaxed);

        if offset.abs() > OFFSET_WARN_MS {
            warn!(
                offset_ms = offset,
                "large clock offset against venue, consider syncing the system clock"
            );
        } else {
            info!(offset_ms = offset, "clock offset calibrated");
        }
        offset
    }

    /// Local time shifted onto the venue's clock.
    pub fn venue_now_ms(&self) -> i64 {
        local_now_ms() + self.get()
    }
}

// -----------------------------------------------------------------------------
// Credentials
// -----------------------------------------------------------------------------

/// API key pair for private streams.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Read `BYBIT_API_KEY` / `BYBIT_API_SECRET`, empty when unset.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("BYBIT_API_KEY").unwrap_or_default(),
            std::env::var("BYBIT_API_SECRET").unwrap_or_default(),
        )
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.is_empty() || self.api_secret.is_empty()
    }

    /// Build a signed request expiring `expiry_ms` after `venue_now_ms`.
    pub fn challenge(
        &self,
        path: &str,
        venue_now_ms: i64,
        expiry_ms: i64,
    ) -> Result<AuthChallenge, ConnectionError> {
        let expires_ms = venue_now_ms + expiry_ms;
        let signature = sign(&auth_payload(path, expires_ms), &self.api_secret)?;
        Ok(AuthChallenge {
            api_key: self.api_key.clone(),
            expires_ms,
            signature,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// One signed authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub api_key: String,
    pub expires_ms: i64,
    pub signature: String,
}

impl AuthChallenge {
    /// Operation frame sent over the socket.
    pub fn to_frame(&self) -> String {
        json!({
            "op": "auth",
            "args": [self.api_key, self.expires_ms, self.signature],
        })
        .to_string()
    }

    /// Whether a handshake finishing at `venue_now_ms` is still inside the
    /// signature's validity window.
    pub fn is_valid_at(&self, venue_now_ms: i64) -> bool {
        venue_now_ms <= self.expires_ms
    }
}
