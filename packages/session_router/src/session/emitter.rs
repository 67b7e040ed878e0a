//! Listener registry shared by every channel a session talks to.
//!
//! A channel owns an `Emitter<E>` and calls `emit` whenever it produces an
//! event. The session attaches a `Listener<E>` on bind and removes all
//! listeners on unbind. Events produced while nothing is attached are parked
//! (up to a limit) and handed to the next listener, so the short window
//! between unbind and rebind never loses traffic.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Default number of events parked while no listener is attached.
pub const DEFAULT_PARKED_LIMIT: usize = 256;

/// A callback registered against an emitter.
pub struct Listener<E> {
    callback: Arc<dyn Fn(E) + Send + Sync>,
}

impl<E> Listener<E> {
    pub fn new(callback: impl Fn(E) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    fn call(&self, event: E) {
        (self.callback)(event)
    }
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        Self {
            callback: self.callback.clone(),
        }
    }
}

impl<E> std::fmt::Debug for Listener<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Listener")
    }
}

struct EmitterInner<E> {
    listeners: Vec<Listener<E>>,
    parked: VecDeque<E>,
    parked_limit: usize,
    dropped: u64,
}

/// Fan-out of events to the currently attached listeners.
pub struct Emitter<E> {
    inner: Arc<Mutex<EmitterInner<E>>>,
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Clone> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> Emitter<E> {
    pub fn new() -> Self {
        Self::with_parked_limit(DEFAULT_PARKED_LIMIT)
    }

    pub fn with_parked_limit(parked_limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EmitterInner {
                listeners: Vec::new(),
                parked: VecDeque::new(),
                parked_limit,
                dropped: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EmitterInner<E>> {
        // A panicking listener must not wedge the channel for everyone else.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver an event to every attached listener, or park it if none are attached.
    pub fn emit(&self, event: E) {
        let listeners = {
            let mut inner = self.lock();
            if inner.listeners.is_empty() {
                if inner.parked.len() >= inner.parked_limit {
                    inner.parked.pop_front();
                    inner.dropped += 1;
                    if inner.dropped == 1 || inner.dropped % 100 == 0 {
                        warn!(dropped = inner.dropped, "Parked event buffer full, dropping oldest");
                    }
                }
                inner.parked.push_back(event);
                return;
            }
            inner.listeners.clone()
        };
        // Callbacks run outside the lock so they may touch the emitter again.
        for listener in &listeners {
            listener.call(event.clone());
        }
    }

    /// Attach a listener. Any parked events are flushed to it first.
    pub fn add_listener(&self, listener: Listener<E>) {
        let parked: Vec<E> = {
            let mut inner = self.lock();
            inner.listeners.push(listener.clone());
            inner.parked.drain(..).collect()
        };
        for event in parked {
            listener.call(event);
        }
    }

    /// Detach every listener. Safe to call when nothing is attached.
    pub fn remove_all_listeners(&self) {
        self.lock().listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn parked_count(&self) -> usize {
        self.lock().parked.len()
    }
}
