//! Counting rendezvous between the calling thread and the channel threads.
//!
//! The caller `enter`s before handing work to another thread, that thread
//! `leave`s when the work completes, and the caller blocks in `wait` until
//! the count is back to zero or the timeout elapses.
//!
//! Only one logical rendezvous may be outstanding at a time. Instead of
//! trusting callers to respect that, every `enter`/`leave` names the
//! rendezvous it belongs to and misuse comes back as a `SyncError`.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;

/// The logical operation a rendezvous belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rendezvous {
    /// Waiting for the worker thread to open the channel.
    Connect,
    /// Waiting for the response to a command.
    Command,
    /// Waiting for the channel to close after a graceful shutdown.
    Disconnect,
}

impl fmt::Display for Rendezvous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Rendezvous::Connect => "connect",
            Rendezvous::Command => "command",
            Rendezvous::Disconnect => "disconnect",
        })
    }
}

/// Result of `Synchronizer::wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    /// `enter` while a different rendezvous is still outstanding.
    #[error("cannot enter {requested} rendezvous while {pending} is outstanding")]
    Busy {
        pending: Rendezvous,
        requested: Rendezvous,
    },

    /// `leave` for a rendezvous other than the outstanding one.
    #[error("{got} leave does not match outstanding {pending} rendezvous")]
    Mismatch { pending: Rendezvous, got: Rendezvous },

    /// `leave` with nothing outstanding (never entered, already left, or abandoned on timeout).
    #[error("unbalanced {0} leave with nothing outstanding")]
    Unbalanced(Rendezvous),
}

/// Lock a mutex, recovering the data if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Inner {
    outstanding: usize,
    pending: Option<Rendezvous>,
}

/// Counting wait/signal primitive.
#[derive(Debug, Default)]
pub struct Synchronizer {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    /// Register a pending wait for `rendezvous`.
    ///
    /// Nested enters for the same rendezvous are counted; entering a
    /// different one while something is outstanding is rejected.
    pub fn enter(&self, rendezvous: Rendezvous) -> Result<(), SyncError> {
        let mut inner = self.lock();
        match inner.pending {
            Some(pending) if pending != rendezvous => Err(SyncError::Busy {
                pending,
                requested: rendezvous,
            }),
            _ => {
                inner.pending = Some(rendezvous);
                inner.outstanding += 1;
                tracing::trace!(%rendezvous, outstanding = inner.outstanding, "enter");
                Ok(())
            }
        }
    }

    /// Signal completion of one `enter` for `rendezvous`.
    ///
    /// Wakes waiters when the count returns to zero. Never underflows.
    pub fn leave(&self, rendezvous: Rendezvous) -> Result<(), SyncError> {
        let mut inner = self.lock();
        let pending = match inner.pending {
            None => return Err(SyncError::Unbalanced(rendezvous)),
            Some(pending) if pending != rendezvous => {
                return Err(SyncError::Mismatch {
                    pending,
                    got: rendezvous,
                })
            }
            Some(pending) => pending,
        };

        inner.outstanding -= 1;
        tracing::trace!(rendezvous = %pending, outstanding = inner.outstanding, "leave");
        if inner.outstanding == 0 {
            inner.pending = None;
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Block until every outstanding enter has been left, or `timeout` elapses.
    ///
    /// On timeout the outstanding rendezvous is abandoned and the count reset,
    /// so a late `leave` is reported as `Unbalanced` instead of being applied
    /// to whatever rendezvous comes next.
    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        let guard = self.lock();
        let (mut inner, result) = self
            .cond
            .wait_timeout_while(guard, timeout, |inner| inner.outstanding > 0)
            .unwrap_or_else(PoisonError::into_inner);

        if result.timed_out() && inner.outstanding > 0 {
            if let Some(pending) = inner.pending.take() {
                tracing::debug!(rendezvous = %pending, outstanding = inner.outstanding, "abandoning rendezvous after timeout");
            }
            inner.outstanding = 0;
            WaitOutcome::TimedOut
        } else {
            WaitOutcome::Signaled
        }
    }

    /// Number of enters not yet left.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// The rendezvous currently outstanding, if any.
    pub fn pending(&self) -> Option<Rendezvous> {
        self.lock().pending
    }
}
