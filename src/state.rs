//! Reactive state container with coalesced, net-change notifications.
//!
//! A [`StateContainer`] holds an immutable [`Snapshot`] of a flat record.
//! Mutations (`patch`, `remove`, `replace`, `modify`) diff against the current
//! snapshot with the container's equality function and accumulate changed keys
//! into a pending change-set. Nothing is delivered synchronously:
//!
//! - inside a tokio runtime, the first mutation of a tick spawns a flush task
//!   that runs once the current task yields;
//! - inside a [`Transaction`](crate::Transaction), the flush is deferred to the
//!   outermost transaction exit;
//! - with no runtime at all, changes stay pending until [`StateContainer::flush`]
//!   is called, which also serves tests and hosts that want determinism.
//!
//! At flush time the pending keys are re-checked against the snapshot taken
//! at the start of the tick, so a value that changes and changes back within
//! one tick produces no notification at all.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use slab::Slab;
use tokio::runtime::Handle;

use crate::hash::{FastIndexMap, FastIndexSet};
use crate::transaction::{DeferredFlush, defer_flush, is_transaction_active};

/// A flat, insertion-ordered state record.
pub type Record<V = Value> = FastIndexMap<String, V>;

/// An immutable view of a record at one point in time.
pub type Snapshot<V = Value> = Arc<Record<V>>;

/// Keys whose values differ between two notifications.
pub type ChangeSet = FastIndexSet<String>;

type Equality<V> = Arc<dyn Fn(&V, &V) -> bool + Send + Sync>;
type Listener<V> = Arc<dyn Fn(&Snapshot<V>, &ChangeSet) + Send + Sync>;

/// Build a [`Record`] from a JSON object. Non-object values yield an empty record.
pub fn record_from_json(value: Value) -> Record {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => Record::default(),
    }
}

/// Render a [`Record`] as a JSON object.
pub fn record_to_json(record: &Record) -> Value {
    Value::Object(
        record
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    )
}

struct ListenerEntry<V> {
    /// `None` listens to every change.
    keys: Option<FastIndexSet<String>>,
    callback: Listener<V>,
}

impl<V> ListenerEntry<V> {
    fn wants(&self, changed: &ChangeSet) -> bool {
        match &self.keys {
            None => true,
            Some(keys) => keys.iter().any(|key| changed.contains(key)),
        }
    }
}

struct Core<V> {
    current: Snapshot<V>,
    /// Snapshot at the first mutation of the current tick.
    baseline: Option<Snapshot<V>>,
    pending: ChangeSet,
    scheduled: bool,
}

impl<V: Clone> Core<V> {
    fn begin_tick(&mut self) {
        if self.baseline.is_none() {
            self.baseline = Some(self.current.clone());
        }
    }
}

struct ContainerInner<V> {
    equality: Equality<V>,
    core: Mutex<Core<V>>,
    listeners: Mutex<Slab<ListenerEntry<V>>>,
}

impl<V: Clone + Send + Sync + 'static> ContainerInner<V> {
    fn differs(&self, old: Option<&V>, new: Option<&V>) -> bool {
        match (old, new) {
            (Some(old), Some(new)) => !(self.equality)(old, new),
            (None, None) => false,
            _ => true,
        }
    }

    fn flush(&self) {
        let (snapshot, changed) = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            core.scheduled = false;
            let Some(baseline) = core.baseline.take() else {
                return;
            };
            let pending = std::mem::take(&mut core.pending);
            let changed: ChangeSet = pending
                .into_iter()
                .filter(|key| self.differs(baseline.get(key), core.current.get(key)))
                .collect();
            if changed.is_empty() {
                cov_mark::hit!(net_empty_flush_skipped);
                return;
            }
            (core.current.clone(), changed)
        };

        // Listeners run without any lock held so they can read or patch again.
        let listeners: Vec<Listener<V>> = self
            .listeners
            .lock()
            .iter()
            .filter(|(_, entry)| entry.wants(&changed))
            .map(|(_, entry)| entry.callback.clone())
            .collect();
        for listener in listeners {
            listener(&snapshot, &changed);
        }
    }
}

impl<V: Clone + Send + Sync + 'static> DeferredFlush for ContainerInner<V> {
    fn flush_deferred(&self) {
        self.flush();
    }

    fn flush_id(&self) -> usize {
        self as *const Self as usize
    }
}

/// Batched reactive container for a flat record of `V` values.
///
/// Cloning a container yields another handle to the same state.
pub struct StateContainer<V = Value> {
    inner: Arc<ContainerInner<V>>,
}

impl<V> Clone for StateContainer<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Clone + PartialEq + Send + Sync + 'static> StateContainer<V> {
    /// Create a container comparing values with `==`.
    pub fn new(initial: Record<V>) -> Self {
        Self::with_equality(initial, |a: &V, b: &V| a == b)
    }
}

impl<V: Clone + Send + Sync + 'static> StateContainer<V> {
    /// Create a container with a custom equality function.
    ///
    /// Two values for which `equality` returns `true` are considered
    /// unchanged and do not produce a notification.
    pub fn with_equality<F>(initial: Record<V>, equality: F) -> Self
    where
        F: Fn(&V, &V) -> bool + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ContainerInner {
                equality: Arc::new(equality),
                core: Mutex::new(Core {
                    current: Arc::new(initial),
                    baseline: None,
                    pending: ChangeSet::default(),
                    scheduled: false,
                }),
                listeners: Mutex::new(Slab::new()),
            }),
        }
    }

    /// The current snapshot.
    pub fn current(&self) -> Snapshot<V> {
        self.inner.core.lock().current.clone()
    }

    /// The current value for one key.
    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.core.lock().current.get(key).cloned()
    }

    /// Whether a flush is pending (changes accumulated but not yet delivered).
    pub fn has_pending(&self) -> bool {
        !self.inner.core.lock().pending.is_empty()
    }

    /// Merge `partial` into the current state.
    ///
    /// Fields equal to their current value are ignored.
    pub fn patch<I, K>(&self, partial: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
    {
        {
            let mut guard = self.inner.core.lock();
            let core = &mut *guard;
            let changes: Vec<(String, V)> = partial
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .filter(|(key, value)| self.inner.differs(core.current.get(key), Some(value)))
                .collect();
            if changes.is_empty() {
                return;
            }

            core.begin_tick();
            let record = Arc::make_mut(&mut core.current);
            for (key, value) in changes {
                core.pending.insert(key.clone());
                record.insert(key, value);
            }
        }
        self.schedule();
    }

    /// Set a single field.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.patch([(key.into(), value)]);
    }

    /// Remove fields from the state.
    pub fn remove<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        {
            let mut guard = self.inner.core.lock();
            let core = &mut *guard;
            let present: Vec<String> = keys
                .into_iter()
                .filter(|key| core.current.contains_key(key.as_ref()))
                .map(|key| key.as_ref().to_string())
                .collect();
            if present.is_empty() {
                return;
            }

            core.begin_tick();
            let record = Arc::make_mut(&mut core.current);
            for key in present {
                record.shift_remove(&key);
                core.pending.insert(key);
            }
        }
        self.schedule();
    }

    /// Replace the whole record, e.g. to reset to an initial state.
    pub fn replace(&self, next: Record<V>) {
        let changed = self.commit(&mut self.inner.core.lock(), next);
        if changed {
            self.schedule();
        }
    }

    /// Mutate a working copy of the record and commit the difference.
    ///
    /// The container stays locked from the read to the commit, so no other
    /// mutation can land in between and be lost. `f` must not touch this same
    /// container.
    pub fn modify<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Record<V>) -> R,
    {
        let (result, changed) = {
            let mut core = self.inner.core.lock();
            let mut next = (*core.current).clone();
            let result = f(&mut next);
            (result, self.commit(&mut core, next))
        };
        if changed {
            self.schedule();
        }
        result
    }

    /// Deliver pending notifications now. Idempotent.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Listen to every change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Snapshot<V>, &ChangeSet) + Send + Sync + 'static,
    {
        self.add_listener(None, Arc::new(listener))
    }

    /// Listen only to changes touching at least one of `keys`.
    pub fn subscribe_keys<I, K, F>(&self, keys: I, listener: F) -> Subscription
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
        F: Fn(&Snapshot<V>, &ChangeSet) + Send + Sync + 'static,
    {
        let keys = keys.into_iter().map(Into::into).collect();
        self.add_listener(Some(keys), Arc::new(listener))
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    fn add_listener(&self, keys: Option<FastIndexSet<String>>, callback: Listener<V>) -> Subscription {
        let key = self
            .inner
            .listeners
            .lock()
            .insert(ListenerEntry { keys, callback });
        let weak: Weak<ContainerInner<V>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().try_remove(key);
            }
        })
    }

    /// Install `next` as the current record. Returns whether anything changed.
    fn commit(&self, core: &mut Core<V>, next: Record<V>) -> bool {
        let changed = self.diff(&core.current, &next);
        if changed.is_empty() {
            return false;
        }
        core.begin_tick();
        core.current = Arc::new(next);
        core.pending.extend(changed);
        true
    }

    fn diff(&self, old: &Record<V>, new: &Record<V>) -> Vec<String> {
        let mut changed: Vec<String> = new
            .iter()
            .filter(|(key, value)| self.inner.differs(old.get(*key), Some(value)))
            .map(|(key, _)| key.clone())
            .collect();
        changed.extend(
            old.keys()
                .filter(|key| !new.contains_key(*key))
                .cloned(),
        );
        changed
    }

    fn schedule(&self) {
        if is_transaction_active() {
            defer_flush(self.inner.clone());
            return;
        }

        {
            let mut core = self.inner.core.lock();
            if core.scheduled || core.pending.is_empty() {
                return;
            }
            core.scheduled = true;
        }

        // Without a runtime the change waits for an explicit flush().
        if let Ok(handle) = Handle::try_current() {
            let weak = Arc::downgrade(&self.inner);
            handle.spawn(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.flush();
                }
            });
        }
    }
}

/// Handle to a registered listener.
///
/// Dropping the handle unsubscribes. Use [`Subscription::forget`] to keep the
/// listener for the lifetime of its source.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new<F>(unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }

    /// Keep the listener registered without holding the handle.
    pub fn forget(mut self) {
        self.unsubscribe = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}
