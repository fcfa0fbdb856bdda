//! Cancellation primitive used for attachment scopes and request execution.
//!
//! An [`AbortController`] owns the right to abort; the [`AbortSignal`] it hands
//! out can be observed three ways:
//!
//! - polled with [`AbortSignal::is_aborted`] / [`AbortSignal::reason`],
//! - awaited with [`AbortSignal::aborted`],
//! - or observed through teardown callbacks registered with
//!   [`AbortSignal::on_abort`], which are guaranteed to run exactly once.
//!
//! Controllers created with [`AbortController::child_of`] abort automatically
//! when their parent aborts, which is how one detach tears down every slice
//! subscription of an attachment at once.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slab::Slab;
use tokio::sync::Notify;

use crate::error::StoreError;

type AbortCallback = Box<dyn FnOnce(&StoreError) + Send>;

struct SignalInner {
    state: Mutex<SignalState>,
    notify: Notify,
}

struct SignalState {
    reason: Option<StoreError>,
    callbacks: Slab<AbortCallback>,
    children: Vec<Weak<SignalInner>>,
}

impl SignalInner {
    fn new() -> Self {
        Self {
            state: Mutex::new(SignalState {
                reason: None,
                callbacks: Slab::new(),
                children: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Returns false if the signal was already aborted.
    fn abort(&self, reason: StoreError) -> bool {
        let (callbacks, children) = {
            let mut state = self.state.lock();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason.clone());
            let callbacks: Vec<_> = state.callbacks.drain().collect();
            (callbacks, std::mem::take(&mut state.children))
        };

        // Lock released: callbacks may touch this signal (read the reason,
        // register more callbacks) without deadlocking.
        self.notify.notify_waiters();
        for callback in callbacks {
            callback(&reason);
        }
        for child in children.iter().filter_map(Weak::upgrade) {
            child.abort(reason.clone());
        }
        true
    }
}

/// Owner side of a cancellation scope.
///
/// Cloning a controller shares the same underlying signal.
#[derive(Clone)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    /// Create a new, independent controller.
    pub fn new() -> Self {
        Self {
            signal: AbortSignal {
                inner: Arc::new(SignalInner::new()),
            },
        }
    }

    /// Create a controller whose signal aborts when `parent` aborts.
    ///
    /// If `parent` is already aborted the child starts out aborted with the
    /// same reason. The parent does not keep the child alive: once every
    /// controller and signal handle for the child is gone, its callbacks are
    /// dropped without running.
    pub fn child_of(parent: &AbortSignal) -> Self {
        let child = Self::new();
        let parent_reason = {
            let mut state = parent.inner.state.lock();
            match &state.reason {
                Some(reason) => Some(reason.clone()),
                None => {
                    state.children.retain(|weak| weak.strong_count() > 0);
                    state.children.push(Arc::downgrade(&child.signal.inner));
                    None
                }
            }
        };
        if let Some(reason) = parent_reason {
            child.signal.inner.abort(reason);
        }
        child
    }

    /// The signal observed by the work this controller governs.
    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Abort with the generic `ABORTED` reason.
    ///
    /// Returns `false` if the signal had already been aborted, in which case
    /// the original reason is kept.
    pub fn abort(&self) -> bool {
        self.signal.inner.abort(StoreError::aborted())
    }

    /// Abort with a specific reason.
    pub fn abort_with(&self, reason: StoreError) -> bool {
        self.signal.inner.abort(reason)
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AbortController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortController")
            .field("aborted", &self.signal.is_aborted())
            .finish()
    }
}

/// Observer side of a cancellation scope.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

impl AbortSignal {
    /// Whether the scope has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.inner.state.lock().reason.is_some()
    }

    /// The abort reason, once aborted.
    pub fn reason(&self) -> Option<StoreError> {
        self.inner.state.lock().reason.clone()
    }

    /// `Err(reason)` if aborted, for early exits with `?` inside handlers.
    pub fn check(&self) -> Result<(), StoreError> {
        match self.reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Wait until the scope is aborted and return the reason.
    pub async fn aborted(&self) -> StoreError {
        loop {
            // Register interest before checking, so an abort between the
            // check and the await still wakes us.
            let notified = self.inner.notify.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }

    /// Run `callback` once when the scope aborts.
    ///
    /// If the scope is already aborted the callback runs immediately on the
    /// calling thread.
    pub fn on_abort<F>(&self, callback: F) -> AbortRegistration
    where
        F: FnOnce(&StoreError) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if let Some(reason) = state.reason.clone() {
            drop(state);
            callback(&reason);
            return AbortRegistration {
                signal: Weak::new(),
                key: None,
            };
        }
        let key = state.callbacks.insert(Box::new(callback));
        AbortRegistration {
            signal: Arc::downgrade(&self.inner),
            key: Some(key),
        }
    }

    /// Whether both handles observe the same scope.
    pub fn same_scope(&self, other: &AbortSignal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Handle to a callback registered with [`AbortSignal::on_abort`].
///
/// Dropping the handle keeps the callback registered; call
/// [`cancel`](Self::cancel) to withdraw it before the scope aborts.
pub struct AbortRegistration {
    signal: Weak<SignalInner>,
    key: Option<usize>,
}

impl AbortRegistration {
    /// Withdraw the callback. Returns `true` if it was still pending.
    pub fn cancel(mut self) -> bool {
        let Some(key) = self.key.take() else {
            return false;
        };
        let Some(inner) = self.signal.upgrade() else {
            return false;
        };
        let removed = inner.state.lock().callbacks.try_remove(key);
        removed.is_some()
    }
}
