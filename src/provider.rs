//! Token provider interface and the immutable token value type (C6).
//!
//! This module defines the boundary to credential sources. Concrete
//! providers — shared-access-signature HMAC generation, cloud-credential
//! fetch with caching — are out of scope (§1) and live outside this crate;
//! only the interface is specified here.

use async_trait::async_trait;
use std::time::Duration;
use time::OffsetDateTime;

/// An opaque security token plus the metadata the CBS layer needs to place
/// it on the wire and track its lifetime.
///
/// Immutable once returned by a provider.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    /// The token payload, already in whatever encoding the peer expects
    /// (e.g. a SAS signature string, a JWT compact serialization).
    pub token: String,
    /// The CBS `type` property, e.g. `"servicebus.windows.net:sastoken"` or
    /// `"jwt"`.
    pub token_type: String,
    /// Absolute UTC instant at which the token stops being valid. The
    /// provider chooses how far in the future this is; callers only ever
    /// read it.
    pub expiry: OffsetDateTime,
}

impl TokenInfo {
    pub fn new(token: impl Into<String>, token_type: impl Into<String>, expiry: OffsetDateTime) -> Self {
        TokenInfo {
            token: token.into(),
            token_type: token_type.into(),
            expiry,
        }
    }

    /// Remaining validity from `now`, or zero if already expired.
    pub fn remaining(&self, now: OffsetDateTime) -> Duration {
        let delta = self.expiry - now;
        if delta.is_negative() {
            Duration::ZERO
        } else {
            delta.unsigned_abs()
        }
    }
}

/// External boundary to a credential source.
///
/// Implementations must be safe under concurrent invocation — the renewal
/// scheduler (C3) may call `get_token` for many audiences at once from its
/// timer callback while the foreground also calls it via `Authenticate`.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(
        &self,
        audience: &str,
        claims: &[String],
        duration: Duration,
    ) -> Result<TokenInfo, Box<dyn std::error::Error + Send + Sync>>;
}
