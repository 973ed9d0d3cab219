//! Exclusive send gate with a bounded wait.
//!
//! Every outbound write holds the gate for the duration of one frame, so
//! writes on a transport are totally ordered. The guard is a Tokio mutex
//! guard and is released on every exit path, including cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

/// Why [`SendGate::lock_within`] did not return a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// The gate stayed busy for the whole bound.
    #[error("gate not acquired within {0:?}")]
    Timeout(Duration),
    /// The gate was closed by shutdown.
    #[error("gate closed")]
    Closed,
}

/// Timed exclusive lock around a value.
#[derive(Debug)]
pub struct SendGate<T> {
    inner: Mutex<T>,
    closed: AtomicBool,
}

impl<T> SendGate<T> {
    /// Creates an open gate guarding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            closed: AtomicBool::new(false),
        }
    }

    /// Acquires the gate, waiting at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Timeout`] when another holder keeps the gate
    /// past `limit`, and [`GateError::Closed`] once [`SendGate::close`] has
    /// been called.
    pub async fn lock_within(&self, limit: Duration) -> Result<MutexGuard<'_, T>, GateError> {
        if self.is_closed() {
            return Err(GateError::Closed);
        }
        let guard = tokio::time::timeout(limit, self.inner.lock())
            .await
            .map_err(|_| GateError::Timeout(limit))?;
        // Closed while we were queued.
        if self.is_closed() {
            return Err(GateError::Closed);
        }
        Ok(guard)
    }

    /// Acquires the gate without a bound, ignoring the closed flag.
    ///
    /// Used by teardown, which must reach the transport even after close.
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().await
    }

    /// Rejects every later [`SendGate::lock_within`] call.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns `true` once the gate has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
