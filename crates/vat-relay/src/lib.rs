//! Credential-refreshing relay for the HMRC VAT (MTD) API
//!
//! Maps logical VAT operations onto provider endpoints and forwards them with
//! the access credential from a client-held session token. Expired
//! credentials are refreshed transparently, at most once per call, with
//! concurrent refreshes for one account coalesced into a single provider
//! request.
//!
//! Call lifecycle:
//! 1. `EndpointRegistry` resolves the operation and substitutes placeholders
//! 2. `RelayDispatcher` refreshes first when the access credential is expired
//! 3. The request is sent; a credential rejection triggers one refresh + retry
//! 4. The provider body is returned, plus the new session if one was minted
//!
//! `VatBroker` bundles the authorization flow from `hmrc-auth` and the relay
//! behind the four gateway operations.

pub mod broker;
pub mod classify;
pub mod coordinator;
pub mod dispatch;
pub mod endpoints;
pub mod error;
pub mod refresh;

#[cfg(test)]
pub(crate) mod testing;

pub use broker::{BrokerSettings, SessionSummary, VatBroker};
pub use classify::{ResponseClass, classify_response};
pub use coordinator::{
    MemoryRefreshCache, RefreshCache, RefreshCoordinator, RefreshKey, RefreshOutcome,
};
pub use dispatch::{
    Rejection, RelayAction, RelayDispatcher, RelayEvent, RelayOutcome, RelayResponse, RelayState,
    advance,
};
pub use endpoints::{ACCOUNT_PLACEHOLDER, EndpointRegistry, EndpointTemplate, Params, QueryParam};
pub use error::{Error, Result};
pub use refresh::TokenRefresher;
