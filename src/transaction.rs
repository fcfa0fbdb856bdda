use std::cell::{Cell, RefCell};
use std::sync::Arc;

/// Something holding pending notifications that a transaction will flush on exit.
pub(crate) trait DeferredFlush: Send + Sync {
    /// Deliver pending notifications now.
    fn flush_deferred(&self);

    /// Identity used to register each container only once per transaction.
    fn flush_id(&self) -> usize;
}

// Thread-local transaction depth counter
// When > 0, containers don't schedule their own flush
thread_local! {
    static TRANSACTION_DEPTH: Cell<usize> = const { Cell::new(0) };
}

// Containers touched during the current outermost transaction, in first-touch order
thread_local! {
    static DEFERRED: RefCell<Vec<Arc<dyn DeferredFlush>>> = const { RefCell::new(Vec::new()) };
}

/// Check if currently inside a transaction on this thread.
pub fn is_transaction_active() -> bool {
    TRANSACTION_DEPTH.with(|d| d.get() > 0)
}

/// Register a container to be flushed when the outermost transaction exits.
pub(crate) fn defer_flush(container: Arc<dyn DeferredFlush>) {
    DEFERRED.with(|deferred| {
        let mut deferred = deferred.borrow_mut();
        let id = container.flush_id();
        if !deferred.iter().any(|c| c.flush_id() == id) {
            deferred.push(container);
        }
    });
}

/// RAII guard that ensures transaction cleanup happens even on panic.
struct TransactionGuard;

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        let outermost = TRANSACTION_DEPTH.with(|d| {
            let depth = d.get().saturating_sub(1);
            d.set(depth);
            depth == 0
        });

        if outermost {
            // Take the list first: a listener running during the flush may
            // open a new transaction of its own.
            let containers = DEFERRED.with(|deferred| std::mem::take(&mut *deferred.borrow_mut()));
            for container in containers {
                container.flush_deferred();
            }
        }
    }
}

/// Batch state mutations across any number of containers into one
/// notification per container.
///
/// Inside a transaction, patches accumulate exactly as they do within one
/// scheduler tick, but nothing is scheduled. When the outermost transaction
/// exits, every container touched inside it is flushed synchronously, in the
/// order they were first touched.
///
/// # Example
/// ```ignore
/// let state = StateContainer::new(Record::default());
/// Transaction::run(|| {
///     state.set("volume", json!(0.5));
///     state.set("muted", json!(false));
/// }); // subscribers see one notification with both keys
/// ```
pub struct Transaction {
    _private: (),
}

impl Transaction {
    /// Run a function within a transaction context.
    pub fn run<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        TRANSACTION_DEPTH.with(|d| d.set(d.get() + 1));

        // If f() panics, the guard still decrements the depth and flushes.
        let _guard = TransactionGuard;

        f()
    }
}
