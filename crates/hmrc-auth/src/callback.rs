//! Authorization callback handling
//!
//! Consumes the pending authorization for the presented state identifier and
//! exchanges the authorization code for provider credentials. The state is
//! deleted before the exchange starts, so a replayed callback fails with
//! `InvalidOrExpiredState` even while the first exchange is still in flight.

use std::sync::Arc;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::session::{IssuedSession, SessionCodec, SessionToken};
use crate::state::StateStore;
use crate::token::TokenClient;

/// Turns a provider redirect into a signed session.
pub struct CallbackExchanger {
    store: Arc<dyn StateStore>,
    client: TokenClient,
    codec: Arc<SessionCodec>,
    clock: Arc<dyn Clock>,
}

impl CallbackExchanger {
    pub fn new(
        store: Arc<dyn StateStore>,
        client: TokenClient,
        codec: Arc<SessionCodec>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            client,
            codec,
            clock,
        }
    }

    /// Complete an authorization from the provider's redirect parameters.
    ///
    /// Produces exactly one session per valid, unconsumed state and none on
    /// any failure path.
    pub async fn complete(
        &self,
        code: &str,
        state_id: &str,
        provider_error: Option<&str>,
    ) -> Result<IssuedSession> {
        if let Some(description) = provider_error {
            warn!(error = description, "provider reported an authorization error");
            return Err(Error::ProviderDeniedAuthorization(description.to_owned()));
        }

        let pending = self
            .store
            .take(state_id)
            .await?
            .ok_or(Error::InvalidOrExpiredState)?;

        let response = self.client.exchange_code(code).await.inspect_err(|e| {
            warn!(
                account_ref = pending.account_ref.as_deref().unwrap_or("<none>"),
                error = %e,
                "authorization code exchange failed"
            );
        })?;

        let now = self.clock.now_millis();
        let token = SessionToken {
            account_ref: pending.account_ref,
            access_credential: response.access_token,
            // exchange_code guarantees a refresh token
            refresh_credential: response.refresh_token.unwrap_or_default(),
            access_expires_at: now.saturating_add(response.expires_in.saturating_mul(1000)),
            issued_at: now,
        };

        let issued = self.codec.issue(token)?;
        info!(
            account_ref = issued.token.account_ref.as_deref().unwrap_or("<none>"),
            expires_at = issued.token.access_expires_at,
            "authorization completed, session issued"
        );
        Ok(issued)
    }
}
