// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Generic typed event bus shared by the repository, graph, and task components.
//!
//! Every mutating operation in the engine emits a typed event after it
//! succeeds (spec §6.4). Listeners register with `on` (forever), `once`
//! (auto-removed after the first delivery), or `wait_on` (a one-shot async
//! wait for the next occurrence); `off` removes a previously registered
//! listener by id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Opaque handle returned by [`EventEmitter::on`] / [`EventEmitter::once`],
/// used to unregister a listener via [`EventEmitter::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum Kind {
    Forever,
    Once,
}

struct Listener<E> {
    id: ListenerId,
    kind: Kind,
    callback: Box<dyn Fn(&E) + Send + Sync>,
}

/// A synchronous, in-process event bus for one event type `E`.
///
/// Callbacks run synchronously on the emitting thread, in registration
/// order, immediately after the mutation they describe has already taken
/// effect: subscribers observe a consistent post-mutation view, never a
/// half-applied one.
pub struct EventEmitter<E> {
    listeners: Mutex<Vec<Listener<E>>>,
    next_id: AtomicU64,
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E: Clone + Send + Sync + 'static> EventEmitter<E> {
    /// Create a new, empty emitter.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, kind: Kind, callback: Box<dyn Fn(&E) + Send + Sync>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push(Listener { id, kind, callback });
        id
    }

    /// Register a listener that fires on every future event until removed.
    pub fn on(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        self.register(Kind::Forever, Box::new(callback))
    }

    /// Register a listener that fires exactly once, then is auto-removed.
    pub fn once(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        self.register(Kind::Once, Box::new(callback))
    }

    /// Unregister a previously registered listener. No-op if already removed.
    pub fn off(&self, id: ListenerId) {
        self.listeners.lock().retain(|l| l.id != id);
    }

    /// Asynchronously wait for the next emitted event.
    pub async fn wait_on(&self) -> E {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        self.once(move |event: &E| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(event.clone());
            }
        });
        // A sender is dropped without sending only if the emitter itself is
        // dropped before the event fires; callers racing shutdown accept
        // that as a cancellation.
        rx.await.unwrap_or_else(|_| {
            panic!("EventEmitter dropped while a wait_on() was pending")
        })
    }

    /// Emit an event, synchronously invoking every registered listener.
    pub fn emit(&self, event: E) {
        let mut listeners = self.listeners.lock();
        listeners.retain_mut(|listener| {
            (listener.callback)(&event);
            !matches!(listener.kind, Kind::Once)
        });
    }

    /// Number of currently registered listeners (forever + pending once).
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}
