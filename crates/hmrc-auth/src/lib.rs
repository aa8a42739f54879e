//! HMRC OAuth authorization and session library
//!
//! Brokers the authorization-code flow against the HMRC developer hub and
//! packages the resulting provider credentials into a signed, client-held
//! session token. The crate has no knowledge of the VAT API itself; relaying
//! calls lives in `vat-relay`.
//!
//! Authorization flow:
//! 1. `AuthorizationInitiator::initiate()` registers a fresh state entry and
//!    returns the consent URL
//! 2. The provider redirects back with `code` + `state`
//! 3. `CallbackExchanger::complete()` consumes the state exactly once,
//!    exchanges the code via `TokenClient`, and mints a session via `SessionCodec`
//! 4. The client stores the opaque session string and presents it verbatim

pub mod authorize;
pub mod callback;
pub mod clock;
pub mod config;
pub mod error;
pub mod session;
pub mod state;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

pub use authorize::{AuthorizationInitiator, AuthorizationRequest, generate_state_id};
pub use callback::CallbackExchanger;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Environment, ProviderConfig};
pub use error::{Error, Result};
pub use session::{IssuedSession, SessionCodec, SessionToken};
pub use state::{MemoryStateStore, PendingAuthorization, StateStore, spawn_sweep_task};
pub use token::{TokenClient, TokenResponse};
