//! Exception reporting side channel.
//!
//! Persistence failures inside `set`/`persist` are swallowed so that a flaky
//! disk never breaks the caller's control flow. They still have to be seen
//! by someone: the manager hands them to an [`ExceptionSink`] injected at
//! construction time.

use crate::error::PersistenceError;

/// Receives persistence failures that are not returned to the caller.
///
/// Implementations must be safe to share across async tasks.
pub trait ExceptionSink: Send + Sync {
    /// Record one failure.
    fn capture(&self, error: &PersistenceError);
}

/// Default sink: emits a `tracing` error event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ExceptionSink for TracingSink {
    fn capture(&self, error: &PersistenceError) {
        tracing::error!(error = %error, "persistence exception captured");
    }
}
