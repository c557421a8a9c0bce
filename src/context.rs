//! Per-call signals
//!
//! Every operation takes the caller's owner scope, cache opt-in and
//! cancellation token explicitly.

use tokio_util::sync::CancellationToken;

/// Caller-provided context for one operation
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Owner scope selecting which pack receives writes (user or tenant)
    pub owner: Option<String>,
    /// Write exchange-sourced blocks back into the local stores
    pub cache: bool,
    /// Aborts in-flight sends and receives at the next suspension point
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }
}
