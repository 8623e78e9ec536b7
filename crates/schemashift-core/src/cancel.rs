//! Cancellation and wall-clock deadline checked at statement boundaries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{MigrationError, Result};

/// Shared cancellation flag plus an optional deadline.
///
/// Clones share the flag, so a caller can hand one clone to the engine and
/// cancel from another thread or a signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<(Instant, Duration)>,
}

impl CancelToken {
    /// A token that never expires on its own.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that expires `limit` from now.
    #[must_use]
    pub fn with_timeout(limit: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Some((Instant::now() + limit, limit)),
        }
    }

    /// Request cancellation. The next statement boundary aborts.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail if cancelled or past the deadline.
    ///
    /// # Errors
    ///
    /// [`MigrationError::Cancelled`] or [`MigrationError::Timeout`].
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }
        match self.deadline {
            Some((at, limit)) if Instant::now() >= at => Err(MigrationError::Timeout(limit)),
            _ => Ok(()),
        }
    }
}
