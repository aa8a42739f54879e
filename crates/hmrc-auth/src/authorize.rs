//! Authorization initiation
//!
//! Generates the anti-replay state identifier, registers it with the state
//! store and builds the HMRC consent URL. The state identifier is only handed
//! out after the store accepted it, so a failed insert never leaves the client
//! holding a URL whose callback can not succeed.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use tracing::info;
use url::Url;

use crate::clock::Clock;
use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::state::{PendingAuthorization, StateStore};

/// Result of starting an authorization flow.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub authorization_url: String,
    pub state_id: String,
}

/// Generate a cryptographically random state identifier.
///
/// 32 random bytes (256 bits) encoded as URL-safe base64 without padding,
/// giving a 43 character token that needs no escaping in a query string.
pub fn generate_state_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the consent URL with all required OAuth parameters.
///
/// Parameters are appended with `application/x-www-form-urlencoded`
/// escaping, so the scope `read:vat write:vat` is sent as
/// `read%3Avat+write%3Avat`.
pub fn build_authorization_url(config: &ProviderConfig, state_id: &str) -> String {
    let mut url: Url = config.authorize_url.clone();
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &config.client_id)
        .append_pair("scope", &config.scope)
        .append_pair("state", state_id)
        .append_pair("redirect_uri", &config.redirect_uri);
    url.into()
}

/// Starts authorization-code flows.
pub struct AuthorizationInitiator {
    store: Arc<dyn StateStore>,
    config: Arc<ProviderConfig>,
    clock: Arc<dyn Clock>,
}

impl AuthorizationInitiator {
    pub fn new(
        store: Arc<dyn StateStore>,
        config: Arc<ProviderConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    /// Register a fresh state for `account_ref` and return the consent URL.
    ///
    /// Fails with `StoreUnavailable` if the state could not be recorded.
    pub async fn initiate(&self, account_ref: Option<&str>) -> Result<AuthorizationRequest> {
        let state_id = generate_state_id();
        let entry = PendingAuthorization {
            state_id: state_id.clone(),
            account_ref: account_ref.map(str::to_owned),
            issued_at: self.clock.now_millis(),
        };

        self.store.insert(entry).await.map_err(|e| match e {
            Error::StoreUnavailable(msg) => Error::StoreUnavailable(msg),
            other => Error::StoreUnavailable(other.to_string()),
        })?;

        info!(
            account_ref = account_ref.unwrap_or("<none>"),
            "authorization flow initiated"
        );

        Ok(AuthorizationRequest {
            authorization_url: build_authorization_url(&self.config, &state_id),
            state_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::state::MemoryStateStore;
    use crate::testing::test_config;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    struct UnavailableStore;

    impl StateStore for UnavailableStore {
        fn insert(
            &self,
            _entry: PendingAuthorization,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async { Err(Error::StoreUnavailable("connection refused".into())) })
        }

        fn take<'a>(
            &'a self,
            _state_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Option<PendingAuthorization>>> + Send + 'a>>
        {
            Box::pin(async { Err(Error::StoreUnavailable("connection refused".into())) })
        }

        fn purge_expired(&self) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>> {
            Box::pin(async { Ok(0) })
        }
    }

    #[test]
    fn state_id_has_256_bits_of_url_safe_entropy() {
        let id = generate_state_id();
        assert_eq!(id.len(), 43);
        assert!(
            id.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "state must be URL-safe base64: {id}"
        );
        assert_ne!(id, generate_state_id(), "two states must not collide");
    }

    #[test]
    fn authorization_url_contains_required_params() {
        let url = build_authorization_url(&test_config(), "state-123");
        let parsed = Url::parse(&url).unwrap();
        let pairs: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();

        assert!(url.starts_with("https://test-api.service.hmrc.gov.uk/oauth/authorize?"));
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "client-abc");
        assert_eq!(pairs["scope"], "read:vat write:vat");
        assert_eq!(pairs["state"], "state-123");
        assert_eq!(
            pairs["redirect_uri"],
            "https://vat.example.com/api/auth/callback"
        );
        // Reserved characters are escaped on the wire
        assert!(url.contains("scope=read%3Avat+write%3Avat"), "got: {url}");
        assert!(url.contains("redirect_uri=https%3A%2F%2Fvat.example.com"));
    }

    #[tokio::test]
    async fn initiate_registers_state_with_account_ref() {
        let clock = Arc::new(ManualClock::new(5_000));
        let store = Arc::new(MemoryStateStore::new(Duration::from_secs(600), clock.clone()));
        let initiator =
            AuthorizationInitiator::new(store.clone(), Arc::new(test_config()), clock);

        let request = initiator.initiate(Some("GB123456789")).await.unwrap();
        assert!(
            request
                .authorization_url
                .contains(&format!("state={}", request.state_id))
        );

        let pending = store.take(&request.state_id).await.unwrap().unwrap();
        assert_eq!(pending.account_ref.as_deref(), Some("GB123456789"));
        assert_eq!(pending.issued_at, 5_000);
    }

    #[tokio::test]
    async fn initiate_without_account_ref() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStateStore::new(Duration::from_secs(600), clock.clone()));
        let initiator =
            AuthorizationInitiator::new(store.clone(), Arc::new(test_config()), clock);

        let request = initiator.initiate(None).await.unwrap();
        let pending = store.take(&request.state_id).await.unwrap().unwrap();
        assert!(pending.account_ref.is_none());
    }

    #[tokio::test]
    async fn unavailable_store_issues_no_url() {
        let initiator = AuthorizationInitiator::new(
            Arc::new(UnavailableStore),
            Arc::new(test_config()),
            Arc::new(ManualClock::new(0)),
        );
        let result = initiator.initiate(Some("GB123456789")).await;
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
    }
}
