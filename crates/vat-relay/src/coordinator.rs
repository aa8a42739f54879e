//! Single-flight refresh coordination
//!
//! Refresh credentials rotate on every use, so two concurrent refreshes with
//! the same stale credential race and the loser is rejected. The coordinator
//! serializes refreshes per account and remembers each result for a short
//! reuse window, keyed by the credential it replaced. A caller still holding
//! the old credential picks up the cached session instead of calling the
//! provider again.
//!
//! The refresh runs on its own task. If the caller is dropped mid-flight
//! (client disconnect), the provider call still completes and its result is
//! cached, so the rotated credential is not lost.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmrc_auth::{Clock, IssuedSession};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// Identifies one refresh: the account and a digest of the refresh
/// credential being exchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefreshKey {
    pub account: String,
    pub rotated_from: String,
}

impl RefreshKey {
    /// Sessions without an account reference are scoped by their credential.
    pub fn new(account_ref: Option<&str>, refresh_credential: &str) -> Self {
        let digest = URL_SAFE_NO_PAD.encode(Sha256::digest(refresh_credential.as_bytes()));
        let account = match account_ref {
            Some(account) => account.to_owned(),
            None => format!("anonymous:{digest}"),
        };
        Self {
            account,
            rotated_from: digest,
        }
    }
}

/// Backing store for recently completed refreshes.
pub trait RefreshCache: Send + Sync {
    fn get<'a>(
        &'a self,
        key: &'a RefreshKey,
    ) -> Pin<Box<dyn Future<Output = Option<IssuedSession>> + Send + 'a>>;

    fn put(
        &self,
        key: RefreshKey,
        issued: IssuedSession,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// In-process refresh cache with a fixed reuse window.
pub struct MemoryRefreshCache {
    entries: tokio::sync::Mutex<HashMap<RefreshKey, (u64, IssuedSession)>>,
    reuse_window: Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryRefreshCache {
    pub fn new(reuse_window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: tokio::sync::Mutex::new(HashMap::new()),
            reuse_window,
            clock,
        }
    }

    fn fresh(&self, stored_at: u64, now: u64) -> bool {
        now.saturating_sub(stored_at) < self.reuse_window.as_millis() as u64
    }
}

impl RefreshCache for MemoryRefreshCache {
    fn get<'a>(
        &'a self,
        key: &'a RefreshKey,
    ) -> Pin<Box<dyn Future<Output = Option<IssuedSession>> + Send + 'a>> {
        Box::pin(async move {
            let now = self.clock.now_millis();
            let entries = self.entries.lock().await;
            entries
                .get(key)
                .filter(|(stored_at, _)| self.fresh(*stored_at, now))
                .map(|(_, issued)| issued.clone())
        })
    }

    fn put(
        &self,
        key: RefreshKey,
        issued: IssuedSession,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let now = self.clock.now_millis();
            let mut entries = self.entries.lock().await;
            entries.retain(|_, (stored_at, _)| self.fresh(*stored_at, now));
            entries.insert(key, (now, issued));
        })
    }
}

/// Result of a coordinated refresh.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub issued: IssuedSession,
    /// True when the session came from an earlier refresh of the same
    /// credential rather than a new provider call.
    pub reused: bool,
}

/// Serializes refreshes per account and shares their results.
pub struct RefreshCoordinator {
    cache: Arc<dyn RefreshCache>,
    guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RefreshCoordinator {
    pub fn new(cache: Arc<dyn RefreshCache>) -> Self {
        Self {
            cache,
            guards: Mutex::new(HashMap::new()),
        }
    }

    /// Run `refresh` for `key` unless an earlier run already replaced the
    /// same credential within the reuse window.
    ///
    /// Failed refreshes are not cached; the next waiter tries again.
    pub async fn run<F, Fut>(&self, key: RefreshKey, refresh: F) -> Result<RefreshOutcome>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<IssuedSession>> + Send + 'static,
    {
        let guard = self.guard(&key.account)?;
        let cache = self.cache.clone();

        let flight = tokio::spawn(async move {
            let _flight = guard.lock_owned().await;
            if let Some(issued) = cache.get(&key).await {
                debug!(account_ref = %key.account, "reusing session from in-flight refresh");
                return Ok(RefreshOutcome {
                    issued,
                    reused: true,
                });
            }
            let issued = refresh().await?;
            cache.put(key, issued.clone()).await;
            Ok(RefreshOutcome {
                issued,
                reused: false,
            })
        });

        flight
            .await
            .map_err(|e| Error::Internal(format!("refresh task failed: {e}")))?
    }

    /// Number of accounts with a live guard.
    pub fn active_accounts(&self) -> usize {
        self.guards.lock().map(|g| g.len()).unwrap_or_default()
    }

    fn guard(&self, account: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut guards = self
            .guards
            .lock()
            .map_err(|_| Error::Internal("refresh guard map poisoned".into()))?;
        // Drop guards nobody else holds
        guards.retain(|_, g| Arc::strong_count(g) > 1);
        Ok(guards
            .entry(account.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }
}
