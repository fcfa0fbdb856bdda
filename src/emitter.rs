//! Minimal named-event emitter for targets.
//!
//! Every listener is registered against an [`AbortSignal`] and disappears when
//! that signal aborts, which is how slice subscriptions tear down all their
//! native listeners at once on detach.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use slab::Slab;

use crate::abort::{AbortRegistration, AbortSignal};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entry<E> {
    /// Guards against slab key reuse after removal.
    serial: u64,
    event: String,
    handler: Handler<E>,
}

struct Handlers<E> {
    entries: Mutex<Slab<Entry<E>>>,
    next_serial: AtomicU64,
}

impl<E> Handlers<E> {
    fn remove(&self, key: usize, serial: u64) -> bool {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|entry| entry.serial == serial) {
            entries.remove(key);
            true
        } else {
            false
        }
    }
}

/// Named-event emitter carrying payloads of type `E`.
///
/// Cloning yields another handle to the same set of listeners.
pub struct EventEmitter<E = Value> {
    handlers: Arc<Handlers<E>>,
}

impl<E> Clone for EventEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self {
            handlers: Arc::new(Handlers {
                entries: Mutex::new(Slab::new()),
                next_serial: AtomicU64::new(0),
            }),
        }
    }
}

impl<E> fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.handlers.entries.lock().len())
            .finish()
    }
}

impl<E: 'static> EventEmitter<E> {
    /// An emitter with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for `event` until `signal` aborts.
    ///
    /// Registering against an already-aborted signal does nothing.
    pub fn on<F>(&self, event: &str, signal: &AbortSignal, handler: F) -> Listener
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        if signal.is_aborted() {
            return Listener::inert();
        }

        let serial = self.handlers.next_serial.fetch_add(1, Ordering::Relaxed);
        let key = self.handlers.entries.lock().insert(Entry {
            serial,
            event: event.to_string(),
            handler: Arc::new(handler),
        });

        let weak = Arc::downgrade(&self.handlers);
        let registration = signal.on_abort(move |_| {
            if let Some(handlers) = weak.upgrade() {
                handlers.remove(key, serial);
            }
        });

        let weak: Weak<Handlers<E>> = Arc::downgrade(&self.handlers);
        Listener {
            remove: Some(Box::new(move || {
                weak.upgrade()
                    .is_some_and(|handlers| handlers.remove(key, serial))
            })),
            registration: Some(registration),
        }
    }

    /// Call every listener for `event`, in registration order.
    ///
    /// Returns how many listeners ran.
    pub fn emit(&self, event: &str, payload: &E) -> usize {
        // Handlers may register or remove listeners, so run them unlocked.
        let handlers: Vec<Handler<E>> = self
            .handlers
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.event == event)
            .map(|(_, entry)| entry.handler.clone())
            .collect();
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    /// Listeners currently registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.handlers
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.event == event)
            .count()
    }
}

/// A registered event listener.
///
/// Dropping the handle keeps the listener; it lives until its signal aborts
/// or [`Listener::off`] is called.
pub struct Listener {
    remove: Option<Box<dyn FnOnce() -> bool + Send>>,
    registration: Option<AbortRegistration>,
}

impl Listener {
    fn inert() -> Self {
        Self {
            remove: None,
            registration: None,
        }
    }

    /// Remove the listener now. Returns `false` if it was already gone.
    pub fn off(mut self) -> bool {
        if let Some(registration) = self.registration.take() {
            registration.cancel();
        }
        self.remove.take().is_some_and(|remove| remove())
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortController;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_reaches_matching_listeners() {
        let emitter = EventEmitter::<f64>::new();
        let scope = AbortController::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let _volume = emitter.on("volumechange", scope.signal(), move |volume| {
            seen_clone.lock().push(*volume);
        });
        let _other = emitter.on("timeupdate", scope.signal(), |_| {});

        assert_eq!(emitter.emit("volumechange", &0.5), 1);
        assert_eq!(*seen.lock(), [0.5]);
    }

    #[test]
    fn abort_removes_listeners() {
        let emitter = EventEmitter::<()>::new();
        let scope = AbortController::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let runs = runs.clone();
            let _ = emitter.on("play", scope.signal(), move |_| {
                runs.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert_eq!(emitter.listener_count("play"), 3);

        scope.abort();
        assert_eq!(emitter.listener_count("play"), 0);
        assert_eq!(emitter.emit("play", &()), 0);
        assert_eq!(runs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn aborted_signal_registers_nothing() {
        let emitter = EventEmitter::<()>::new();
        let scope = AbortController::new();
        scope.abort();

        let listener = emitter.on("play", scope.signal(), |_| {});

        assert_eq!(emitter.listener_count("play"), 0);
        assert!(!listener.off());
    }

    #[test]
    fn off_removes_only_its_listener() {
        let emitter = EventEmitter::<()>::new();
        let scope = AbortController::new();

        let first = emitter.on("pause", scope.signal(), |_| {});
        let _second = emitter.on("pause", scope.signal(), |_| {});

        assert!(first.off());
        assert_eq!(emitter.listener_count("pause"), 1);
    }

    #[test]
    fn stale_listener_handle_does_not_remove_reused_slot() {
        let emitter = EventEmitter::<()>::new();
        let old_scope = AbortController::new();
        let new_scope = AbortController::new();

        let stale = emitter.on("pause", old_scope.signal(), |_| {});
        old_scope.abort();
        let _fresh = emitter.on("pause", new_scope.signal(), |_| {});

        assert!(!stale.off());
        assert_eq!(emitter.listener_count("pause"), 1);
    }
}
