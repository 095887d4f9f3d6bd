use std::sync::{Arc, OnceLock};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Why a flow ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// The handler finished or the service shut down.
    Closed,
    /// No packet moved within the idle timeout.
    IdleTimeout,
    /// The table was full and this flow was the least recently used.
    Evicted,
    /// The upstream failed.
    Error,
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseCause::Closed => "closed",
            CloseCause::IdleTimeout => "idle timeout",
            CloseCause::Evicted => "evicted",
            CloseCause::Error => "error",
        };
        f.write_str(s)
    }
}

/// A cancellation token that remembers the first reason it was cancelled with.
#[derive(Debug, Clone)]
pub struct CancelContext {
    token: CancellationToken,
    cause: Arc<OnceLock<CloseCause>>,
}

impl CancelContext {
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            cause: Arc::new(OnceLock::new()),
        }
    }

    /// Cancels with `cause`. Later calls keep the first cause.
    pub fn cancel(&self, cause: CloseCause) {
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    /// The recorded cause, or `Closed` when the parent was cancelled.
    pub fn cause(&self) -> Option<CloseCause> {
        if !self.token.is_cancelled() {
            return None;
        }
        Some(self.cause.get().copied().unwrap_or(CloseCause::Closed))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
