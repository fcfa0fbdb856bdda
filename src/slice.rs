//! Slices: independently authored units of state, subscriptions and requests.
//!
//! A [`Slice`] contributes initial state, an optional snapshot function that
//! reads live values off the target, an optional subscribe function that wires
//! native events to state updates, and a set of named [`Request`]s. Slices are
//! merged with [`compose`], which refuses overlapping state keys or request
//! names instead of letting the later slice win silently.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::abort::AbortSignal;
use crate::error::{ComposeError, StoreError};
use crate::hash::FastIndexMap;
use crate::queue::TaskOutput;
use crate::schedule::{Debounce, Scheduler};
use crate::state::{Record, Snapshot, StateContainer};

type SnapshotFn<T> = Arc<dyn Fn(SnapshotContext<T>) -> Result<Record, StoreError> + Send + Sync>;
type SubscribeFn<T> = Arc<dyn Fn(SubscribeContext<T>) -> Result<(), StoreError> + Send + Sync>;
type HandlerFn<T> = Arc<dyn Fn(Value, RequestContext<T>) -> BoxFuture<'static, TaskOutput> + Send + Sync>;
type KeyFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

// =============================================================================
// Contexts
// =============================================================================

/// Passed to a slice's snapshot function on every attach and update.
pub struct SnapshotContext<T> {
    /// The attached target.
    pub target: Arc<T>,
    /// The merged initial state of the store.
    pub initial_state: Snapshot,
}

/// Passed to a slice's subscribe function on attach.
pub struct SubscribeContext<T> {
    /// The attached target.
    pub target: Arc<T>,
    /// Aborted when this attachment ends. Scope every listener to it.
    pub signal: AbortSignal,
    /// Feeds target changes back into the store.
    pub updater: Updater,
}

/// Passed to every guard of a request.
pub struct GuardContext<T> {
    /// The attached target.
    pub target: Arc<T>,
    /// The task's signal.
    pub signal: AbortSignal,
}

impl<T> Clone for GuardContext<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            signal: self.signal.clone(),
        }
    }
}

/// Passed to a request handler.
pub struct RequestContext<T> {
    /// The attached target.
    pub target: Arc<T>,
    /// The task's signal; aborted on supersession, `abort` or `destroy`.
    pub signal: AbortSignal,
    /// Caller provenance, forwarded untouched.
    pub meta: Option<RequestMeta>,
    /// Name the request was invoked under.
    pub name: String,
}

/// Caller-supplied provenance for a request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    /// Who issued the request, e.g. `"keyboard"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Milliseconds since the Unix epoch when the request was issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Free-form reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Anything else the caller wants the handler to see.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl RequestMeta {
    /// Meta carrying only a source.
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::default()
        }
    }
}

// =============================================================================
// Updater
// =============================================================================

/// Handle a slice subscription uses to push changes into the store.
///
/// Both entry points are no-ops once the attachment signal has aborted, so a
/// listener left behind on an old target can never write into the store.
#[derive(Clone)]
pub struct Updater {
    signal: AbortSignal,
    state: StateContainer,
    refresh: Arc<dyn Fn() + Send + Sync>,
}

impl Updater {
    pub(crate) fn new<F>(signal: AbortSignal, state: StateContainer, refresh: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            signal,
            state,
            refresh: Arc::new(refresh),
        }
    }

    /// Re-run this slice's snapshot function and patch the result.
    pub fn update(&self) {
        if self.signal.is_aborted() {
            cov_mark::hit!(stale_update_ignored);
            return;
        }
        (self.refresh)();
    }

    /// Patch fields directly.
    pub fn patch<I, K>(&self, partial: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        if self.signal.is_aborted() {
            cov_mark::hit!(stale_update_ignored);
            return;
        }
        self.state.patch(partial);
    }

    /// Whether the attachment this updater belongs to is still live.
    pub fn is_active(&self) -> bool {
        !self.signal.is_aborted()
    }
}

// =============================================================================
// Requests
// =============================================================================

/// How a request's supersession key is derived.
#[derive(Clone)]
pub enum RequestKey {
    /// The same key for every call.
    Static(String),
    /// A key computed from the call's input.
    Dynamic(KeyFn),
}

impl RequestKey {
    /// Resolve the key for one call.
    pub fn resolve(&self, input: &Value) -> String {
        match self {
            RequestKey::Static(key) => key.clone(),
            RequestKey::Dynamic(key_fn) => key_fn(input),
        }
    }
}

impl fmt::Debug for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKey::Static(key) => f.debug_tuple("Static").field(key).finish(),
            RequestKey::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

enum GuardKind<T> {
    Sync(Arc<dyn Fn(&GuardContext<T>) -> bool + Send + Sync>),
    Async(Arc<dyn Fn(GuardContext<T>) -> BoxFuture<'static, bool> + Send + Sync>),
}

/// A predicate that may veto a request before its handler runs.
pub struct Guard<T> {
    kind: GuardKind<T>,
}

impl<T> Clone for Guard<T> {
    fn clone(&self) -> Self {
        let kind = match &self.kind {
            GuardKind::Sync(check) => GuardKind::Sync(check.clone()),
            GuardKind::Async(check) => GuardKind::Async(check.clone()),
        };
        Self { kind }
    }
}

impl<T: Send + Sync + 'static> Guard<T> {
    /// A synchronous guard.
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&GuardContext<T>) -> bool + Send + Sync + 'static,
    {
        Self {
            kind: GuardKind::Sync(Arc::new(check)),
        }
    }

    /// A guard that has to wait for something, e.g. the target becoming ready.
    pub fn new_async<F, Fut>(check: F) -> Self
    where
        F: Fn(GuardContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self {
            kind: GuardKind::Async(Arc::new(move |cx| check(cx).boxed())),
        }
    }

    /// Evaluate the guard.
    pub async fn check(&self, cx: GuardContext<T>) -> bool {
        match &self.kind {
            GuardKind::Sync(check) => check(&cx),
            GuardKind::Async(check) => check(cx).await,
        }
    }
}

/// Configuration of one named request.
///
/// # Example
/// ```ignore
/// let change_volume = Request::from_fn(|input, cx: RequestContext<Media>| {
///     let volume = input.as_f64().unwrap_or(1.0).clamp(0.0, 1.0);
///     cx.target.set_volume(volume);
///     Ok(json!(volume))
/// })
/// .key("volume")
/// .guard(|cx| !cx.target.is_locked());
/// ```
pub struct Request<T> {
    key: Option<RequestKey>,
    guards: Vec<Guard<T>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    handler: HandlerFn<T>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            guards: self.guards.clone(),
            scheduler: self.scheduler.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Request<T> {
    /// A request with an asynchronous handler.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value, RequestContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutput> + Send + 'static,
    {
        Self {
            key: None,
            guards: Vec::new(),
            scheduler: None,
            handler: Arc::new(move |input, cx| handler(input, cx).boxed()),
        }
    }

    /// A request whose handler completes without awaiting anything.
    pub fn from_fn<F>(handler: F) -> Self
    where
        F: Fn(Value, RequestContext<T>) -> TaskOutput + Send + Sync + 'static,
    {
        Self::new(move |input, cx| futures::future::ready(handler(input, cx)))
    }

    /// Share a supersession key with other requests.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(RequestKey::Static(key.into()));
        self
    }

    /// Derive the supersession key from the input.
    pub fn key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.key = Some(RequestKey::Dynamic(Arc::new(key_fn)));
        self
    }

    /// Append a synchronous guard. Guards run in the order they were added.
    pub fn guard<F>(mut self, check: F) -> Self
    where
        F: Fn(&GuardContext<T>) -> bool + Send + Sync + 'static,
    {
        self.guards.push(Guard::new(check));
        self
    }

    /// Append an asynchronous guard.
    pub fn guard_async<F, Fut>(mut self, check: F) -> Self
    where
        F: Fn(GuardContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.guards.push(Guard::new_async(check));
        self
    }

    /// Decide when calls start instead of on the next runtime turn.
    pub fn scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Some(Arc::new(scheduler));
        self
    }

    /// Start calls only after `delay` without a newer call on the same key.
    pub fn debounce(self, delay: Duration) -> Self {
        self.scheduler(Debounce(delay))
    }
}

impl<T> Request<T> {
    pub(crate) fn resolve_key(&self, name: &str, input: &Value) -> String {
        match &self.key {
            Some(key) => key.resolve(input),
            None => name.to_string(),
        }
    }

    pub(crate) fn guards(&self) -> &[Guard<T>] {
        &self.guards
    }

    pub(crate) fn handler(&self) -> HandlerFn<T> {
        self.handler.clone()
    }

    pub(crate) fn scheduler_ref(&self) -> Option<Arc<dyn Scheduler>> {
        self.scheduler.clone()
    }
}

// =============================================================================
// Slice
// =============================================================================

/// A composable unit of state, subscriptions and requests over a target `T`.
pub struct Slice<T> {
    name: String,
    initial_state: Record,
    snapshot: Option<SnapshotFn<T>>,
    subscribe: Option<SubscribeFn<T>>,
    requests: FastIndexMap<String, Request<T>>,
}

impl<T: Send + Sync + 'static> Slice<T> {
    /// An empty slice. `name` shows up in composition and hook errors.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial_state: Record::default(),
            snapshot: None,
            subscribe: None,
            requests: FastIndexMap::default(),
        }
    }

    /// State this slice owns, with the values used while detached.
    pub fn state<I, K>(mut self, initial: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.initial_state
            .extend(initial.into_iter().map(|(key, value)| (key.into(), value)));
        self
    }

    /// Read current values off the target.
    pub fn snapshot<F>(mut self, snapshot: F) -> Self
    where
        F: Fn(SnapshotContext<T>) -> Result<Record, StoreError> + Send + Sync + 'static,
    {
        self.snapshot = Some(Arc::new(snapshot));
        self
    }

    /// Wire target events to [`Updater`] calls.
    pub fn subscribe<F>(mut self, subscribe: F) -> Self
    where
        F: Fn(SubscribeContext<T>) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        self.subscribe = Some(Arc::new(subscribe));
        self
    }

    /// Register a named request. A second registration under the same name
    /// replaces the first.
    pub fn request(mut self, name: impl Into<String>, request: Request<T>) -> Self {
        self.requests.insert(name.into(), request);
        self
    }
}

impl<T> Slice<T> {
    /// Name of the slice.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The slice's own initial state.
    pub fn initial_state(&self) -> &Record {
        &self.initial_state
    }

    /// Names of the requests this slice registers.
    pub fn request_names(&self) -> impl Iterator<Item = &str> {
        self.requests.keys().map(String::as_str)
    }
}

// =============================================================================
// Composition
// =============================================================================

/// The lifecycle parts of one slice kept after composition.
pub(crate) struct SliceHooks<T> {
    pub(crate) name: String,
    pub(crate) snapshot: Option<SnapshotFn<T>>,
    pub(crate) subscribe: Option<SubscribeFn<T>>,
}

/// Several slices merged into one.
pub struct ComposedSlices<T> {
    hooks: Vec<SliceHooks<T>>,
    initial_state: Snapshot,
    requests: FastIndexMap<String, Request<T>>,
}

impl<T> ComposedSlices<T> {
    /// Merged initial state.
    pub fn initial_state(&self) -> &Snapshot {
        &self.initial_state
    }

    /// Look up a request by name.
    pub fn request(&self, name: &str) -> Option<&Request<T>> {
        self.requests.get(name)
    }

    /// Every registered request name, in registration order.
    pub fn request_names(&self) -> impl Iterator<Item = &str> {
        self.requests.keys().map(String::as_str)
    }

    /// Number of composed slices.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no slice was composed.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub(crate) fn hooks(&self) -> &[SliceHooks<T>] {
        &self.hooks
    }
}

/// Merge slices, rejecting overlapping state keys and request names.
pub fn compose<T, I>(slices: I) -> Result<ComposedSlices<T>, ComposeError>
where
    I: IntoIterator<Item = Slice<T>>,
{
    let mut state_owner: FastIndexMap<String, String> = FastIndexMap::default();
    let mut request_owner: FastIndexMap<String, String> = FastIndexMap::default();
    let mut initial_state = Record::default();
    let mut requests = FastIndexMap::default();
    let mut hooks = Vec::new();

    for slice in slices {
        for (key, value) in slice.initial_state {
            if let Some(first) = state_owner.get(&key) {
                return Err(ComposeError::DuplicateStateKey {
                    key,
                    first: first.clone(),
                    second: slice.name,
                });
            }
            state_owner.insert(key.clone(), slice.name.clone());
            initial_state.insert(key, value);
        }

        for (name, request) in slice.requests {
            if let Some(first) = request_owner.get(&name) {
                return Err(ComposeError::DuplicateRequest {
                    name,
                    first: first.clone(),
                    second: slice.name,
                });
            }
            request_owner.insert(name.clone(), slice.name.clone());
            requests.insert(name, request);
        }

        hooks.push(SliceHooks {
            name: slice.name,
            snapshot: slice.snapshot,
            subscribe: slice.subscribe,
        });
    }

    Ok(ComposedSlices {
        hooks,
        initial_state: Arc::new(initial_state),
        requests,
    })
}
