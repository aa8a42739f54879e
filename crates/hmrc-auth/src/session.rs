//! Signed session tokens
//!
//! A session token carries the provider credentials for one account across
//! requests without any server-side record. Its external form is
//!
//! ```text
//! base64url(json claims) "." base64url(HMAC-SHA256(key, first segment))
//! ```
//!
//! The signature covers the encoded claims segment exactly as transmitted.
//! `decode` verifies it in constant time before the claims are even
//! base64-decoded, so a tampered token never exposes a field.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Decoded session contents.
///
/// Timestamps are unix milliseconds. `Debug` redacts both credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    #[serde(rename = "vrn", default, skip_serializing_if = "Option::is_none")]
    pub account_ref: Option<String>,
    #[serde(rename = "at")]
    pub access_credential: String,
    #[serde(rename = "rt")]
    pub refresh_credential: String,
    #[serde(rename = "exp")]
    pub access_expires_at: u64,
    #[serde(rename = "iat")]
    pub issued_at: u64,
}

impl SessionToken {
    /// Whether the access credential is expired, or will be within `margin`.
    pub fn access_expired(&self, now: u64, margin: Duration) -> bool {
        now.saturating_add(margin.as_millis() as u64) >= self.access_expires_at
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("account_ref", &self.account_ref)
            .field("access_credential", &"[REDACTED]")
            .field("refresh_credential", &"[REDACTED]")
            .field("access_expires_at", &self.access_expires_at)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// A freshly minted session: the decoded token and its signed external form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedSession {
    pub token: SessionToken,
    pub encoded: String,
}

/// Signs and verifies session tokens with a server-held key.
pub struct SessionCodec {
    key: Secret<Vec<u8>>,
    session_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionCodec {
    /// `session_ttl` bounds how long a token is accepted after it was
    /// minted, regardless of its access-credential expiry.
    pub fn new(key: Secret<Vec<u8>>, session_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            key,
            session_ttl,
            clock,
        }
    }

    /// Serialize and sign a token.
    pub fn encode(&self, token: &SessionToken) -> Result<String> {
        let claims =
            serde_json::to_vec(token).map_err(|e| Error::Encoding(format!("claims: {e}")))?;
        let payload = URL_SAFE_NO_PAD.encode(claims);
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{payload}.{signature}"))
    }

    /// Sign a token and pair it with its external form.
    pub fn issue(&self, token: SessionToken) -> Result<IssuedSession> {
        let encoded = self.encode(&token)?;
        Ok(IssuedSession { token, encoded })
    }

    /// Verify and decode a token.
    ///
    /// Fails with `TamperedOrInvalidToken` on any structural or signature
    /// problem, and with `SessionExpired` for a genuine token older than the
    /// session lifetime.
    pub fn decode(&self, encoded: &str) -> Result<SessionToken> {
        let (payload, signature) = encoded
            .split_once('.')
            .ok_or(Error::TamperedOrInvalidToken)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| Error::TamperedOrInvalidToken)?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        if mac.verify_slice(&signature).is_err() {
            debug!("session token signature mismatch");
            return Err(Error::TamperedOrInvalidToken);
        }

        let claims = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| Error::TamperedOrInvalidToken)?;
        let token: SessionToken =
            serde_json::from_slice(&claims).map_err(|_| Error::TamperedOrInvalidToken)?;

        let now = self.clock.now_millis();
        if now.saturating_sub(token.issued_at) > self.session_ttl.as_millis() as u64 {
            return Err(Error::SessionExpired);
        }
        Ok(token)
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(self.key.expose())
            .map_err(|e| Error::Encoding(format!("signing key: {e}")))
    }
}
