// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Cooperative cancellation signal propagated from the graph runner down
//! through a task's execution context (spec §5 "Cancellation").
//!
//! Modeled as a single flag plus a `Notify`, rather than pulling in
//! `tokio_util::sync::CancellationToken`: the engine only ever needs a
//! parent-to-children broadcast, never the token's child-cancels-parent
//! hierarchy, so a small purpose-built type keeps the dependency surface
//! aligned with the rest of the crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    aborted: AtomicBool,
    notify: Notify,
}

/// A cloneable cancellation signal. Cloning shares the same underlying
/// flag; `cancel()` on any clone is visible to every other clone.
#[derive(Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<Inner>,
}

impl CancellationSignal {
    /// A fresh, not-yet-cancelled signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the signal cancelled and wake every `cancelled()` waiter.
    pub fn cancel(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// The `signal.aborted` check a task makes at its own suspension
    /// points (spec §5).
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolves the next time `cancel()` is called, or immediately if it
    /// already was. Intended for `tokio::select!` against a task's own
    /// I/O futures.
    pub async fn cancelled(&self) {
        if self.is_aborted() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }
}
