//! Session refresh
//!
//! Exchanges a session's refresh credential for a new access credential and
//! mints a replacement session. Every refresh goes through the
//! `RefreshCoordinator`, so concurrent refreshes of one account converge on a
//! single provider call. No retry happens here: a rejected refresh
//! credential surfaces as `RefreshRejected` and the client has to authorize
//! again.

use std::sync::Arc;

use hmrc_auth::{Clock, IssuedSession, SessionCodec, SessionToken, TokenClient};
use tracing::{info, warn};

use crate::coordinator::{RefreshCoordinator, RefreshKey};
use crate::error::{Error, Result};

/// Refreshes sessions with single-flight coordination per account.
pub struct TokenRefresher {
    client: TokenClient,
    codec: Arc<SessionCodec>,
    coordinator: Arc<RefreshCoordinator>,
    clock: Arc<dyn Clock>,
}

impl TokenRefresher {
    pub fn new(
        client: TokenClient,
        codec: Arc<SessionCodec>,
        coordinator: Arc<RefreshCoordinator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            codec,
            coordinator,
            clock,
        }
    }

    /// Mint a new session from `session`'s refresh credential.
    ///
    /// A caller presenting a credential that was already rotated within the
    /// reuse window receives the session that rotation produced.
    pub async fn refresh(&self, session: &SessionToken) -> Result<IssuedSession> {
        let key = RefreshKey::new(
            session.account_ref.as_deref(),
            &session.refresh_credential,
        );
        let client = self.client.clone();
        let codec = self.codec.clone();
        let clock = self.clock.clone();
        let prior = session.clone();

        let result = self
            .coordinator
            .run(key, move || async move {
                let response = client.refresh(&prior.refresh_credential).await?;
                let now = clock.now_millis();
                let expires_at = now.saturating_add(response.expires_in.saturating_mul(1000));
                let token = SessionToken {
                    account_ref: prior.account_ref,
                    access_credential: response.access_token,
                    refresh_credential: response
                        .refresh_token
                        .unwrap_or(prior.refresh_credential),
                    // Never move expiry backwards
                    access_expires_at: expires_at.max(prior.access_expires_at),
                    issued_at: now,
                };
                Ok::<_, Error>(codec.issue(token)?)
            })
            .await;

        let account_ref = session.account_ref.as_deref().unwrap_or("<none>");
        let outcome = match &result {
            Ok(outcome) if outcome.reused => "reused",
            Ok(_) => {
                info!(account_ref, "session refreshed");
                "refreshed"
            }
            Err(Error::Auth(hmrc_auth::Error::RefreshRejected { status, .. })) => {
                warn!(account_ref, status, "refresh credential rejected by provider");
                "rejected"
            }
            Err(e) => {
                warn!(account_ref, error = %e, "session refresh failed");
                "failed"
            }
        };
        metrics::counter!("relay_token_refresh_total", "outcome" => outcome).increment(1);

        result.map(|outcome| outcome.issued)
    }
}
