//! Gateway-facing facade
//!
//! `VatBroker` wires the authorization components from `hmrc-auth` and the
//! relay together and exposes them as operations on opaque session strings.
//! Callers never see a `SessionToken` they did not get from the broker, and
//! every operation that takes a session verifies it first.

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use hmrc_auth::{
    AuthorizationInitiator, AuthorizationRequest, CallbackExchanger, Clock, IssuedSession,
    ProviderConfig, SessionCodec, StateStore, TokenClient,
};
use url::Url;

use crate::coordinator::{RefreshCache, RefreshCoordinator};
use crate::dispatch::{RelayDispatcher, RelayOutcome};
use crate::endpoints::{EndpointRegistry, Params};
use crate::error::Result;
use crate::refresh::TokenRefresher;

/// Everything the broker needs besides its injected stores and clock.
pub struct BrokerSettings {
    pub provider: ProviderConfig,
    /// Root of the VAT API, endpoint paths are appended to it
    pub api_base_url: Url,
    pub signing_key: Secret<Vec<u8>>,
    /// Maximum age of a session token
    pub session_ttl: Duration,
    /// Credentials expiring within this margin are refreshed before use
    pub refresh_margin: Duration,
    pub registry: EndpointRegistry,
    pub http: reqwest::Client,
}

/// Non-secret view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub account_ref: Option<String>,
    /// Unix milliseconds
    pub access_expires_at: u64,
    /// Whether the access credential is past its expiry (ignoring the margin)
    pub expired: bool,
}

/// Authorization, session and relay operations over opaque session tokens.
pub struct VatBroker {
    initiator: AuthorizationInitiator,
    exchanger: CallbackExchanger,
    codec: Arc<SessionCodec>,
    refresher: Arc<TokenRefresher>,
    dispatcher: RelayDispatcher,
    state_store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl VatBroker {
    pub fn new(
        settings: BrokerSettings,
        state_store: Arc<dyn StateStore>,
        refresh_cache: Arc<dyn RefreshCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let timeout = settings.provider.timeout;
        let provider = Arc::new(settings.provider);
        let codec = Arc::new(SessionCodec::new(
            settings.signing_key,
            settings.session_ttl,
            clock.clone(),
        ));
        let token_client = TokenClient::new(settings.http.clone(), provider.clone());
        let refresher = Arc::new(TokenRefresher::new(
            token_client.clone(),
            codec.clone(),
            Arc::new(RefreshCoordinator::new(refresh_cache)),
            clock.clone(),
        ));
        let dispatcher = RelayDispatcher::new(
            settings.http,
            settings.api_base_url,
            Arc::new(settings.registry),
            refresher.clone(),
            clock.clone(),
            timeout,
            settings.refresh_margin,
        );

        Self {
            initiator: AuthorizationInitiator::new(state_store.clone(), provider, clock.clone()),
            exchanger: CallbackExchanger::new(
                state_store.clone(),
                token_client,
                codec.clone(),
                clock.clone(),
            ),
            codec,
            refresher,
            dispatcher,
            state_store,
            clock,
        }
    }

    /// The pending-authorization store, for the sweeper task.
    pub fn state_store(&self) -> Arc<dyn StateStore> {
        self.state_store.clone()
    }

    /// Start an authorization flow, optionally bound to an account reference.
    ///
    /// A blank account reference is treated as absent.
    pub async fn initiate_authorization(
        &self,
        account_ref: Option<&str>,
    ) -> Result<AuthorizationRequest> {
        let account_ref = account_ref.map(str::trim).filter(|s| !s.is_empty());
        Ok(self.initiator.initiate(account_ref).await?)
    }

    /// Complete a flow from the provider's redirect parameters.
    pub async fn complete_authorization(
        &self,
        code: &str,
        state_id: &str,
        provider_error: Option<&str>,
    ) -> Result<IssuedSession> {
        Ok(self
            .exchanger
            .complete(code, state_id, provider_error)
            .await?)
    }

    /// Exchange a session for one with a fresh access credential.
    pub async fn refresh_session(&self, session: &str) -> Result<IssuedSession> {
        let token = self.codec.decode(session)?;
        self.refresher.refresh(&token).await
    }

    /// Decode a session without touching the provider.
    pub fn describe_session(&self, session: &str) -> Result<SessionSummary> {
        let token = self.codec.decode(session)?;
        Ok(SessionSummary {
            expired: token.access_expired(self.clock.now_millis(), Duration::ZERO),
            account_ref: token.account_ref,
            access_expires_at: token.access_expires_at,
        })
    }

    /// Relay a VAT operation on behalf of `session`.
    pub async fn dispatch(
        &self,
        operation: &str,
        params: &Params,
        payload: Option<&serde_json::Value>,
        session: &str,
    ) -> RelayOutcome {
        match self.codec.decode(session) {
            Ok(token) => {
                self.dispatcher
                    .dispatch(operation, params, payload, token)
                    .await
            }
            Err(e) => RelayOutcome::failed(e.into()),
        }
    }
}
