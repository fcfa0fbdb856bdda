//! The store facade: one target, composed slices, a state container and a
//! task queue, bound together by an attachment lifecycle.
//!
//! ```text
//! Created ──attach──▶ Attached ◀──attach── (re-attach supersedes)
//!    │                   │
//!    │                detach
//!    │                   ▼
//!    └──────────────▶ Detached ──destroy──▶ Destroyed (terminal)
//! ```
//!
//! Every attachment owns an abort scope that is a child of the store's setup
//! scope, and every slice subscription gets a child of the attachment scope.
//! Ending an attachment aborts its scope, which tears down every listener the
//! slices registered for it. Destroying the store aborts the setup scope.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::abort::{AbortController, AbortSignal};
use crate::error::{ComposeError, HookError, HookPhase, StoreError};
use crate::queue::{EnqueueRequest, TaskFuture, TaskQueue};
use crate::slice::{
    ComposedSlices, GuardContext, RequestContext, RequestMeta, Slice, SliceHooks, SnapshotContext,
    SubscribeContext, Updater, compose,
};
use crate::state::{ChangeSet, Record, Snapshot, StateContainer, Subscription};

type SetupHook<T> = Box<dyn Fn(SetupContext<'_, T>) -> Result<(), StoreError> + Send + Sync>;
type AttachHook<T> = Box<dyn Fn(AttachContext<'_, T>) -> Result<(), StoreError> + Send + Sync>;
type ErrorSink = Box<dyn Fn(&HookError) + Send + Sync>;

/// Passed to the `on_setup` hook, once, when the store is built.
pub struct SetupContext<'a, T> {
    /// The store being set up.
    pub store: &'a Store<T>,
    /// Aborted when the store is destroyed.
    pub signal: &'a AbortSignal,
}

/// Passed to the `on_attach` hook after every attach.
pub struct AttachContext<'a, T> {
    /// The store.
    pub store: &'a Store<T>,
    /// The target just attached.
    pub target: &'a Arc<T>,
    /// Aborted when this attachment ends.
    pub signal: &'a AbortSignal,
}

struct Hooks<T> {
    on_setup: Option<SetupHook<T>>,
    on_attach: Option<AttachHook<T>>,
    on_error: Option<ErrorSink>,
}

struct Attachment<T> {
    id: u64,
    target: Arc<T>,
    scope: AbortController,
    /// One child of `scope` per subscribed slice, held so their teardown
    /// callbacks survive until the attachment ends.
    slice_scopes: Vec<AbortController>,
}

struct StoreInner<T> {
    composed: ComposedSlices<T>,
    state: StateContainer,
    queue: TaskQueue,
    /// Lives as long as the store; parent of every attachment scope.
    setup: AbortController,
    attachment: parking_lot::Mutex<Option<Attachment<T>>>,
    next_attachment: AtomicU64,
    destroyed: AtomicBool,
    hooks: Hooks<T>,
    abort_requests_on_detach: bool,
}

impl<T> StoreInner<T> {
    fn target(&self) -> Option<Arc<T>> {
        self.attachment
            .lock()
            .as_ref()
            .map(|attachment| attachment.target.clone())
    }

    fn report(&self, error: HookError) {
        let Some(sink) = &self.hooks.on_error else {
            tracing::warn!(
                phase = %error.phase,
                slice = error.slice.as_deref().unwrap_or("-"),
                error = %error.error,
                "store hook failed"
            );
            return;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink(&error))) {
            tracing::warn!(
                phase = %error.phase,
                slice = error.slice.as_deref().unwrap_or("-"),
                error = %error.error,
                panic = %StoreError::from_panic(payload),
                "store error sink panicked"
            );
        }
    }

    /// Run a lifecycle hook, routing errors and panics to the error sink.
    fn run_hook<R>(
        &self,
        phase: HookPhase,
        slice: Option<&str>,
        hook: impl FnOnce() -> Result<R, StoreError>,
    ) -> Option<R> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(hook))
            .unwrap_or_else(|payload| Err(StoreError::from_panic(payload)));
        match outcome {
            Ok(value) => Some(value),
            Err(error) => {
                self.report(HookError {
                    phase,
                    slice: slice.map(str::to_string),
                    error,
                });
                None
            }
        }
    }

    fn snapshot_slice(&self, slice: &SliceHooks<T>, target: &Arc<T>) -> Option<Record> {
        let snapshot = slice.snapshot.as_ref()?;
        self.run_hook(HookPhase::Snapshot, Some(&slice.name), || {
            snapshot(SnapshotContext {
                target: target.clone(),
                initial_state: self.composed.initial_state().clone(),
            })
        })
    }

    /// Re-snapshot one slice against the current target.
    fn refresh(&self, index: usize) {
        let (Some(target), Some(slice)) = (self.target(), self.composed.hooks().get(index)) else {
            return;
        };
        if let Some(partial) = self.snapshot_slice(slice, &target) {
            self.state.patch(partial);
        }
    }

    /// End the current attachment, or only attachment `only` if given.
    fn release(&self, only: Option<u64>) -> bool {
        let released = {
            let mut current = self.attachment.lock();
            match (only, current.as_ref()) {
                (Some(id), Some(attachment)) if attachment.id != id => {
                    cov_mark::hit!(stale_detach_ignored);
                    None
                }
                _ => current.take(),
            }
        };
        let Some(attachment) = released else {
            return false;
        };

        attachment.scope.abort();
        self.state
            .replace((**self.composed.initial_state()).clone());
        if self.abort_requests_on_detach {
            self.queue.abort(None);
        }
        tracing::debug!(attachment = attachment.id, "target detached");
        true
    }
}

impl<T> Drop for StoreInner<T> {
    fn drop(&mut self) {
        self.setup.abort_with(StoreError::destroyed());
        self.queue.destroy();
    }
}

/// Builder for [`Store`].
///
/// # Example
/// ```ignore
/// let store = Store::builder()
///     .slice(volume_slice())
///     .slice(playback_slice())
///     .on_error(|err| eprintln!("{err}"))
///     .build()?;
/// ```
pub struct StoreBuilder<T> {
    slices: Vec<Slice<T>>,
    hooks: Hooks<T>,
    abort_requests_on_detach: bool,
}

impl<T: Send + Sync + 'static> Default for StoreBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> StoreBuilder<T> {
    /// A builder with no slices and no hooks.
    pub fn new() -> Self {
        Self {
            slices: Vec::new(),
            hooks: Hooks {
                on_setup: None,
                on_attach: None,
                on_error: None,
            },
            abort_requests_on_detach: false,
        }
    }

    /// Add a slice.
    pub fn slice(mut self, slice: Slice<T>) -> Self {
        self.slices.push(slice);
        self
    }

    /// Add several slices.
    pub fn slices(mut self, slices: impl IntoIterator<Item = Slice<T>>) -> Self {
        self.slices.extend(slices);
        self
    }

    /// Run once when the store is built.
    pub fn on_setup<F>(mut self, hook: F) -> Self
    where
        F: Fn(SetupContext<'_, T>) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        self.hooks.on_setup = Some(Box::new(hook));
        self
    }

    /// Run after every attach, once the state has been seeded.
    pub fn on_attach<F>(mut self, hook: F) -> Self
    where
        F: Fn(AttachContext<'_, T>) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        self.hooks.on_attach = Some(Box::new(hook));
        self
    }

    /// Receive every failure caught at a lifecycle boundary.
    ///
    /// Without a sink, failures are logged with `tracing::warn!`.
    pub fn on_error<F>(mut self, sink: F) -> Self
    where
        F: Fn(&HookError) + Send + Sync + 'static,
    {
        self.hooks.on_error = Some(Box::new(sink));
        self
    }

    /// Whether detaching also aborts queued and pending requests.
    ///
    /// Off by default: in-flight requests stay observable across a detach and
    /// settle against the target they started with.
    pub fn abort_requests_on_detach(mut self, enabled: bool) -> Self {
        self.abort_requests_on_detach = enabled;
        self
    }

    /// Compose the slices and create the store.
    pub fn build(self) -> Result<Store<T>, ComposeError> {
        let composed = compose(self.slices)?;
        let state = StateContainer::new((**composed.initial_state()).clone());

        let store = Store {
            inner: Arc::new(StoreInner {
                composed,
                state,
                queue: TaskQueue::new(),
                setup: AbortController::new(),
                attachment: parking_lot::Mutex::new(None),
                next_attachment: AtomicU64::new(1),
                destroyed: AtomicBool::new(false),
                hooks: self.hooks,
                abort_requests_on_detach: self.abort_requests_on_detach,
            }),
        };

        let inner = &store.inner;
        if let Some(on_setup) = &inner.hooks.on_setup {
            inner.run_hook(HookPhase::Setup, None, || {
                on_setup(SetupContext {
                    store: &store,
                    signal: inner.setup.signal(),
                })
            });
        }
        tracing::debug!(
            slices = inner.composed.len(),
            requests = inner.composed.request_names().count(),
            "store created"
        );
        Ok(store)
    }
}

/// Reactive store over a target of type `T`.
///
/// Cloning yields another handle to the same store.
pub struct Store<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Store<T> {
    /// Start configuring a store.
    pub fn builder() -> StoreBuilder<T> {
        StoreBuilder::new()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Bind the store to `target`, replacing any current attachment.
    ///
    /// 1. The previous attachment (if any) is detached.
    /// 2. The target is stored and the state reset to the initial state.
    /// 3. Every slice's subscribe function runs under its own child signal of
    ///    the new attachment scope.
    /// 4. Every slice is snapshotted and the results are patched in one go.
    /// 5. `on_attach` runs.
    ///
    /// On a destroyed store this does nothing and returns an inert handle.
    pub fn attach(&self, target: impl Into<Arc<T>>) -> Detach<T> {
        if self.is_destroyed() {
            cov_mark::hit!(attach_after_destroy);
            return Detach {
                store: Weak::new(),
                attachment: None,
            };
        }

        let inner = &self.inner;
        let target = target.into();
        inner.release(None);

        let scope = AbortController::child_of(inner.setup.signal());
        let id = inner.next_attachment.fetch_add(1, Ordering::Relaxed);
        *inner.attachment.lock() = Some(Attachment {
            id,
            target: target.clone(),
            scope: scope.clone(),
            slice_scopes: Vec::new(),
        });
        inner
            .state
            .replace((**inner.composed.initial_state()).clone());

        for (index, slice) in inner.composed.hooks().iter().enumerate() {
            let Some(subscribe) = &slice.subscribe else {
                continue;
            };
            let slice_scope = AbortController::child_of(scope.signal());
            let signal = slice_scope.signal().clone();
            if let Some(attachment) = inner.attachment.lock().as_mut() {
                attachment.slice_scopes.push(slice_scope);
            }
            let store = Arc::downgrade(inner);
            let updater = Updater::new(signal.clone(), inner.state.clone(), move || {
                if let Some(inner) = store.upgrade() {
                    inner.refresh(index);
                }
            });
            inner.run_hook(HookPhase::Subscribe, Some(&slice.name), || {
                subscribe(SubscribeContext {
                    target: target.clone(),
                    signal,
                    updater,
                })
            });
        }

        let mut seeded = Record::default();
        for slice in inner.composed.hooks() {
            if let Some(partial) = inner.snapshot_slice(slice, &target) {
                seeded.extend(partial);
            }
        }
        inner.state.patch(seeded);

        if let Some(on_attach) = &inner.hooks.on_attach {
            inner.run_hook(HookPhase::Attach, None, || {
                on_attach(AttachContext {
                    store: self,
                    target: &target,
                    signal: scope.signal(),
                })
            });
        }

        tracing::debug!(attachment = id, "target attached");
        Detach {
            store: Arc::downgrade(inner),
            attachment: Some(id),
        }
    }

    /// Detach the current target, if any. Returns `false` if none was attached.
    pub fn detach(&self) -> bool {
        self.inner.release(None)
    }

    /// Tear the store down for good.
    ///
    /// Detaches, aborts the setup scope and destroys the queue, rejecting all
    /// queued and pending requests. Calling it again does nothing.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.release(None);
        self.inner.setup.abort_with(StoreError::destroyed());
        self.inner.queue.destroy();
        tracing::debug!("store destroyed");
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Whether a target is attached.
    pub fn is_attached(&self) -> bool {
        self.inner.attachment.lock().is_some()
    }

    /// The attached target.
    pub fn target(&self) -> Option<Arc<T>> {
        self.inner.target()
    }

    // =========================================================================
    // State
    // =========================================================================

    /// The current merged snapshot.
    pub fn state(&self) -> Snapshot {
        self.inner.state.current()
    }

    /// The current value of one state key.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.state.get(key)
    }

    /// The merged initial state.
    pub fn initial_state(&self) -> &Snapshot {
        self.inner.composed.initial_state()
    }

    /// Listen to every state change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Snapshot, &ChangeSet) + Send + Sync + 'static,
    {
        self.inner.state.subscribe(listener)
    }

    /// Listen to changes of specific state keys.
    pub fn subscribe_keys<I, K, F>(&self, keys: I, listener: F) -> Subscription
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
        F: Fn(&Snapshot, &ChangeSet) + Send + Sync + 'static,
    {
        self.inner.state.subscribe_keys(keys, listener)
    }

    /// Deliver pending state and task notifications now.
    pub fn flush(&self) {
        self.inner.state.flush();
        self.inner.queue.flush();
    }

    /// The task queue executing this store's requests.
    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Every registered request name.
    pub fn request_names(&self) -> impl Iterator<Item = &str> {
        self.inner.composed.request_names()
    }

    /// Invoke a request.
    pub fn request(&self, name: &str, input: Value) -> TaskFuture {
        self.request_with_meta(name, input, None)
    }

    /// Invoke a request with caller provenance.
    ///
    /// Rejects immediately on a destroyed store or an unknown name. Otherwise
    /// the call is queued under its supersession key; when it starts, the
    /// target must still be attached and every guard must pass, in order,
    /// before the handler runs.
    pub fn request_with_meta(&self, name: &str, input: Value, meta: Option<RequestMeta>) -> TaskFuture {
        if self.is_destroyed() {
            return TaskFuture::ready(Err(StoreError::destroyed()));
        }
        let Some(request) = self.inner.composed.request(name) else {
            return TaskFuture::ready(Err(StoreError::UnknownRequest {
                name: name.to_string(),
            }));
        };

        let key = request.resolve_key(name, &input);
        let guards = request.guards().to_vec();
        let handler = request.handler();
        let store = Arc::downgrade(&self.inner);
        let task_name = name.to_string();
        let task_meta = meta.clone();

        let execute = move |input: Value, signal: AbortSignal| async move {
            let Some(target) = store.upgrade().and_then(|inner| inner.target()) else {
                return Err(StoreError::NoTarget);
            };

            for guard in &guards {
                let cx = GuardContext {
                    target: target.clone(),
                    signal: signal.clone(),
                };
                signal.check()?;
                let passed = guard.check(cx).await;
                signal.check()?;
                if !passed {
                    cov_mark::hit!(guard_rejected_request);
                    return Err(StoreError::RequestCancelled { name: task_name });
                }
            }

            handler(
                input,
                RequestContext {
                    target,
                    signal,
                    meta: task_meta,
                    name: task_name,
                },
            )
            .await
        };

        self.inner.queue.enqueue(
            EnqueueRequest::new(name, execute)
                .key(key)
                .input(input)
                .meta(meta)
                .scheduler(request.scheduler_ref()),
        )
    }

    /// A reusable handle for one request name, or `None` if it is unknown.
    pub fn requester(&self, name: &str) -> Option<Requester<T>> {
        self.inner.composed.request(name)?;
        Some(Requester {
            store: self.clone(),
            name: name.to_string(),
        })
    }
}

/// Returned by [`Store::attach`]; detaches that specific attachment.
///
/// Dropping it does nothing.
pub struct Detach<T> {
    store: Weak<StoreInner<T>>,
    attachment: Option<u64>,
}

impl<T> Detach<T> {
    /// Detach, but only if this attachment is still the current one.
    pub fn detach(self) -> bool {
        match (self.store.upgrade(), self.attachment) {
            (Some(inner), Some(id)) => inner.release(Some(id)),
            _ => false,
        }
    }

    /// Whether this attachment is still the current one.
    pub fn is_current(&self) -> bool {
        match (self.store.upgrade(), self.attachment) {
            (Some(inner), Some(id)) => inner
                .attachment
                .lock()
                .as_ref()
                .is_some_and(|attachment| attachment.id == id),
            _ => false,
        }
    }
}

/// A callable bound to one request name.
pub struct Requester<T> {
    store: Store<T>,
    name: String,
}

impl<T> Clone for Requester<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            name: self.name.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Requester<T> {
    /// The request name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the request.
    pub fn call(&self, input: Value) -> TaskFuture {
        self.store.request(&self.name, input)
    }

    /// Invoke the request with caller provenance.
    pub fn call_with_meta(&self, input: Value, meta: RequestMeta) -> TaskFuture {
        self.store.request_with_meta(&self.name, input, Some(meta))
    }
}
