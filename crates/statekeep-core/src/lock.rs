//! Named shared/exclusive lock guarding the persisted state.
//!
//! Writers (`set`, `persist`, `reset`) take the lock exclusively and readers
//! (`get`) share it. The underlying tokio `RwLock` is fair: a queued writer
//! blocks later readers, and a writer waits for every current reader.
//!
//! Exclusive requests can carry a [`CancellationToken`]. A request cancelled
//! while still queued never acquires the lock; once the guard is granted,
//! cancelling the token has no effect on the holder.

use std::sync::Arc;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default lock name shared by every component touching persisted state.
pub const STATE_LOCK: &str = "state-lock";

/// A named, cloneable handle to one process-wide lock.
#[derive(Debug, Clone)]
pub struct NamedLock {
    name: Arc<str>,
    inner: Arc<RwLock<()>>,
}

impl NamedLock {
    /// Create a new, unheld lock.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            inner: Arc::new(RwLock::new(())),
        }
    }

    /// The lock's name, used in log events.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for exclusive access, giving up if `token` is cancelled first.
    ///
    /// Returns `None` if the request was cancelled while queued.
    pub async fn exclusive(&self, token: &CancellationToken) -> Option<OwnedRwLockWriteGuard<()>> {
        if token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            () = token.cancelled() => {
                debug!(lock = %self.name, "exclusive lock request cancelled while queued");
                None
            }
            guard = Arc::clone(&self.inner).write_owned() => Some(guard),
        }
    }

    /// Wait for exclusive access with no way to cancel.
    pub async fn exclusive_uncancellable(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.inner).write_owned().await
    }

    /// Wait for shared access.
    pub async fn shared(&self) -> OwnedRwLockReadGuard<()> {
        Arc::clone(&self.inner).read_owned().await
    }
}

impl Default for NamedLock {
    fn default() -> Self {
        Self::new(STATE_LOCK)
    }
}
