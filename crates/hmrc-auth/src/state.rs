//! Pending-authorization state store
//!
//! Maps an opaque state identifier to the account reference that started the
//! flow. Entries are consumed exactly once: `take` removes and returns the
//! entry under a single lock acquisition, so two callbacks racing on the same
//! identifier see one winner. An entry older than the state window is treated
//! as absent even if the sweeper has not removed it yet.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::Result;

/// A consent request awaiting its callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub state_id: String,
    /// VAT registration number supplied by the client, if any
    pub account_ref: Option<String>,
    /// Unix milliseconds
    pub issued_at: u64,
}

impl PendingAuthorization {
    /// Whether the entry has outlived `ttl` at time `now` (unix millis).
    pub fn is_expired(&self, now: u64, ttl: Duration) -> bool {
        now.saturating_sub(self.issued_at) >= ttl.as_millis() as u64
    }
}

/// Concurrency-safe, expiring store for pending authorizations.
///
/// Uses `Pin<Box<dyn Future>>` return types so the store can be shared as
/// `Arc<dyn StateStore>` and swapped for an external backend.
pub trait StateStore: Send + Sync {
    /// Register a new pending authorization.
    fn insert(
        &self,
        entry: PendingAuthorization,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Atomically fetch and delete an entry. Returns `None` when the
    /// identifier was never issued, was already consumed, or has expired.
    fn take<'a>(
        &'a self,
        state_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<PendingAuthorization>>> + Send + 'a>>;

    /// Remove expired entries, returning how many were dropped.
    fn purge_expired(&self) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>>;
}

/// In-process state store backed by a mutex-guarded map.
pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, PendingAuthorization>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryStateStore {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Number of entries currently held, including expired ones not yet swept.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl StateStore for MemoryStateStore {
    fn insert(
        &self,
        entry: PendingAuthorization,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            entries.insert(entry.state_id.clone(), entry);
            Ok(())
        })
    }

    fn take<'a>(
        &'a self,
        state_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<PendingAuthorization>>> + Send + 'a>> {
        Box::pin(async move {
            let removed = self.entries.lock().await.remove(state_id);
            let now = self.clock.now_millis();
            Ok(removed.filter(|entry| {
                let expired = entry.is_expired(now, self.ttl);
                if expired {
                    debug!("presented state identifier has expired");
                }
                !expired
            }))
        })
    }

    fn purge_expired(&self) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>> {
        Box::pin(async move {
            let now = self.clock.now_millis();
            let mut entries = self.entries.lock().await;
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now, self.ttl));
            Ok(before - entries.len())
        })
    }
}

/// Spawn a background task that evicts expired pending authorizations.
///
/// Runs every `interval`. Store failures are logged and retried on the next
/// tick. Abort the returned handle at shutdown.
pub fn spawn_sweep_task(
    store: Arc<dyn StateStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The store starts empty; nothing to sweep on the first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "swept expired authorization states"),
                Err(e) => warn!(error = %e, "state sweep failed, will retry next cycle"),
            }
        }
    })
}
