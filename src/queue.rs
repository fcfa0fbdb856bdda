//! Keyed task queue with supersession and observable lifecycle records.
//!
//! ## Lifecycle of one task
//!
//! 1. [`TaskQueue::enqueue`] runs synchronously. It displaces any *queued*
//!    task that occupies the same key (rejecting it with `SUPERSEDED`), aborts
//!    any *pending* task with the same key whatever its name, parks the new
//!    task in the key's slot and hands a start job to the scheduler.
//! 2. When the job runs, the task leaves its slot and is recorded under its
//!    name as [`TaskStatus::Pending`] with its own [`AbortController`]. The
//!    controller is also indexed by task id until settlement, so aborts and
//!    supersession still reach a task whose record a newer one replaced.
//! 3. The handler future is raced against that controller's signal. Whichever
//!    finishes first decides the outcome; an abort always wins.
//! 4. The record is only rewritten if it still belongs to this task (same
//!    [`TaskId`]). A newer task with the same name has already replaced it
//!    otherwise, and a late settlement must not clobber it. The awaiting
//!    caller receives the outcome either way.
//!
//! Records live in a [`StateContainer`], so task lifecycle notifications are
//! batched exactly like store state notifications.

use std::future::Future;
use std::pin::{Pin, pin};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::{BoxFuture, Either, FutureExt, select};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::abort::{AbortController, AbortSignal};
use crate::error::StoreError;
use crate::hash::FastIndexMap;
use crate::schedule::{CancelSchedule, Microtask, Scheduler};
use crate::slice::RequestMeta;
use crate::state::{ChangeSet, Record, Snapshot, StateContainer, Subscription};

/// Outcome of one task.
pub type TaskOutput = Result<Value, StoreError>;

/// Type-erased handler run by the queue.
pub type TaskHandler = Box<dyn FnOnce(Value, AbortSignal) -> BoxFuture<'static, TaskOutput> + Send>;

/// Unique, monotonically increasing task identifier.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Coarse status without payload.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TaskPhase {
    /// Executing.
    Pending,
    /// Settled with an output.
    Success,
    /// Settled with an error.
    Error,
}

/// Status of a recorded task.
#[derive(Clone, Debug)]
pub enum TaskStatus {
    /// The handler is running. `abort` is the only way to cancel it.
    Pending {
        /// Controller owning the handler's signal.
        abort: AbortController,
    },
    /// The handler resolved.
    Success {
        /// When it settled.
        settled_at: Instant,
        /// What it returned.
        output: Value,
    },
    /// The handler failed or was cancelled.
    Error {
        /// When it settled.
        settled_at: Instant,
        /// Why it failed.
        error: StoreError,
        /// `true` when the task's own signal was aborted.
        cancelled: bool,
    },
}

impl TaskStatus {
    /// Coarse phase of this status.
    pub fn phase(&self) -> TaskPhase {
        match self {
            TaskStatus::Pending { .. } => TaskPhase::Pending,
            TaskStatus::Success { .. } => TaskPhase::Success,
            TaskStatus::Error { .. } => TaskPhase::Error,
        }
    }
}

/// Lifecycle record of one request execution.
#[derive(Clone, Debug)]
pub struct Task {
    /// Identity of this execution.
    pub id: TaskId,
    /// Request name; records are stored under it.
    pub name: String,
    /// Supersession key.
    pub key: String,
    /// Input the handler received.
    pub input: Value,
    /// Provenance supplied by the caller.
    pub meta: Option<RequestMeta>,
    /// When the handler started.
    pub started_at: Instant,
    /// Current status.
    pub status: TaskStatus,
}

impl Task {
    /// Whether the handler is still running.
    pub fn is_pending(&self) -> bool {
        matches!(self.status, TaskStatus::Pending { .. })
    }

    /// The output, if the task succeeded.
    pub fn output(&self) -> Option<&Value> {
        match &self.status {
            TaskStatus::Success { output, .. } => Some(output),
            _ => None,
        }
    }

    /// The error, if the task failed.
    pub fn error(&self) -> Option<&StoreError> {
        match &self.status {
            TaskStatus::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Whether the task settled because its signal was aborted.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.status, TaskStatus::Error { cancelled: true, .. })
    }

    /// Abort the task if it is still pending.
    pub fn abort(&self, reason: StoreError) -> bool {
        match &self.status {
            TaskStatus::Pending { abort } => abort.abort_with(reason),
            _ => false,
        }
    }
}

/// Everything `enqueue` needs to run one task.
pub struct EnqueueRequest {
    name: String,
    key: Option<String>,
    input: Value,
    meta: Option<RequestMeta>,
    scheduler: Option<Arc<dyn Scheduler>>,
    handler: TaskHandler,
}

impl EnqueueRequest {
    /// A request named `name` whose key defaults to its name.
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: FnOnce(Value, AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = TaskOutput> + Send + 'static,
    {
        Self {
            name: name.into(),
            key: None,
            input: Value::Null,
            meta: None,
            scheduler: None,
            handler: Box::new(move |input, signal| handler(input, signal).boxed()),
        }
    }

    /// Supersession key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Handler input.
    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Caller provenance.
    pub fn meta(mut self, meta: Option<RequestMeta>) -> Self {
        self.meta = meta;
        self
    }

    /// Scheduler deciding when the task starts (default: [`Microtask`]).
    pub fn scheduler(mut self, scheduler: Option<Arc<dyn Scheduler>>) -> Self {
        self.scheduler = scheduler;
        self
    }
}

/// Future resolving to a task's outcome.
///
/// Dropping it does not cancel the task; use [`TaskQueue::abort`] for that.
#[must_use = "a TaskFuture reports the outcome of the request"]
pub struct TaskFuture {
    id: Option<TaskId>,
    state: FutureState,
}

enum FutureState {
    Ready(Option<TaskOutput>),
    Waiting(oneshot::Receiver<TaskOutput>),
}

impl TaskFuture {
    pub(crate) fn ready(output: TaskOutput) -> Self {
        Self {
            id: None,
            state: FutureState::Ready(Some(output)),
        }
    }

    fn waiting(id: TaskId, receiver: oneshot::Receiver<TaskOutput>) -> Self {
        Self {
            id: Some(id),
            state: FutureState::Waiting(receiver),
        }
    }

    /// Id of the task, or `None` if the request was rejected before queuing.
    pub fn id(&self) -> Option<TaskId> {
        self.id
    }
}

impl Future for TaskFuture {
    type Output = TaskOutput;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            FutureState::Ready(output) => {
                Poll::Ready(output.take().unwrap_or_else(|| Err(StoreError::removed())))
            }
            // A dropped sender means the queue went away without settling.
            FutureState::Waiting(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|received| received.unwrap_or_else(|_| Err(StoreError::removed()))),
        }
    }
}

struct Queued {
    id: TaskId,
    name: String,
    input: Value,
    meta: Option<RequestMeta>,
    handler: TaskHandler,
    responder: oneshot::Sender<TaskOutput>,
    cancel: Option<CancelSchedule>,
}

impl Queued {
    fn reject(self, reason: StoreError) {
        if let Some(cancel) = self.cancel {
            cancel();
        }
        let _ = self.responder.send(Err(reason));
    }
}

/// A started task that has not settled yet.
struct Running {
    name: String,
    key: String,
    abort: AbortController,
}

struct QueueInner {
    tasks: StateContainer<Task>,
    /// Queued (not yet started) tasks by supersession key.
    slots: Mutex<FastIndexMap<String, Queued>>,
    /// Started tasks by id. A record can be replaced by a newer task with the
    /// same name while the older one still runs; this index still reaches it.
    running: Mutex<FastIndexMap<TaskId, Running>>,
    next_id: AtomicU64,
    destroyed: AtomicBool,
}

impl QueueInner {
    fn take_queued<P>(&self, matches: P) -> Vec<Queued>
    where
        P: Fn(&Queued) -> bool,
    {
        let mut slots = self.slots.lock();
        let keys: Vec<String> = slots
            .iter()
            .filter(|(_, queued)| matches(queued))
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter().filter_map(|key| slots.shift_remove(key)).collect()
    }

    /// Abort running tasks selected by `matches(name, key)`.
    fn abort_pending<P>(&self, matches: P, reason: &StoreError) -> usize
    where
        P: Fn(&str, &str) -> bool,
    {
        // Collect first: aborting runs callbacks that may touch the queue.
        let controllers: Vec<AbortController> = self
            .running
            .lock()
            .values()
            .filter(|running| matches(&running.name, &running.key))
            .map(|running| running.abort.clone())
            .collect();
        controllers
            .into_iter()
            .filter(|abort| abort.abort_with(reason.clone()))
            .count()
    }

    fn start(self: &Arc<Self>, key: &str, id: TaskId) {
        let queued = {
            let mut slots = self.slots.lock();
            match slots.get(key) {
                Some(queued) if queued.id == id => slots.shift_remove(key),
                _ => None,
            }
        };
        // Withdrawn between scheduling and running.
        let Some(queued) = queued else {
            return;
        };
        let Queued {
            name,
            input,
            meta,
            handler,
            responder,
            ..
        } = queued;

        let controller = AbortController::new();
        let signal = controller.signal().clone();
        self.tasks.set(
            name.clone(),
            Task {
                id,
                name: name.clone(),
                key: key.to_string(),
                input: input.clone(),
                meta,
                started_at: Instant::now(),
                status: TaskStatus::Pending {
                    abort: controller.clone(),
                },
            },
        );
        self.running.lock().insert(
            id,
            Running {
                name: name.clone(),
                key: key.to_string(),
                abort: controller,
            },
        );
        tracing::debug!(task = %name, id = id.0, key, "task started");

        let Ok(runtime) = Handle::try_current() else {
            let output = Err(StoreError::msg("task queue requires a tokio runtime"));
            self.settle(&name, id, &output, false);
            let _ = responder.send(output);
            return;
        };

        let work = handler(input, signal.clone());
        let queue = Arc::downgrade(self);
        runtime.spawn(async move {
            let output = {
                let aborted = pin!(signal.aborted());
                match select(aborted, work).await {
                    Either::Left((reason, _)) => Err(reason),
                    Either::Right((output, _)) => output,
                }
            };
            // An abort racing a completed handler still counts as an abort.
            let (output, cancelled) = match signal.reason() {
                Some(reason) => (Err(reason), true),
                None => (output, false),
            };
            if let Some(queue) = queue.upgrade() {
                queue.settle(&name, id, &output, cancelled);
            }
            let _ = responder.send(output);
        });
    }

    fn settle(&self, name: &str, id: TaskId, output: &TaskOutput, cancelled: bool) {
        self.running.lock().shift_remove(&id);

        let settled_at = Instant::now();
        let status = match output {
            Ok(output) => TaskStatus::Success {
                settled_at,
                output: output.clone(),
            },
            Err(error) => TaskStatus::Error {
                settled_at,
                error: error.clone(),
                cancelled,
            },
        };

        // Check and write under one lock so a concurrent start or reset
        // cannot slip in between.
        let written = self.tasks.modify(|record| {
            match record.get_mut(name).filter(|task| task.id == id) {
                Some(task) => {
                    task.status = status;
                    true
                }
                None => false,
            }
        });
        if !written {
            cov_mark::hit!(stale_settlement_ignored);
            tracing::trace!(task = %name, id = id.0, "settlement for replaced task ignored");
            return;
        }
        tracing::debug!(
            task = %name,
            id = id.0,
            ok = output.is_ok(),
            cancelled,
            "task settled"
        );
    }
}

/// Executes named, keyed asynchronous operations.
///
/// Cloning yields another handle to the same queue. All spawning goes
/// through the ambient tokio runtime; on a current-thread runtime this gives
/// the single-threaded cooperative model the ordering guarantees assume.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                tasks: StateContainer::with_equality(Record::default(), |a: &Task, b: &Task| {
                    a.id == b.id && a.status.phase() == b.status.phase()
                }),
                slots: Mutex::new(FastIndexMap::default()),
                running: Mutex::new(FastIndexMap::default()),
                next_id: AtomicU64::new(1),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Queue a task. See the module docs for the supersession rules.
    pub fn enqueue(&self, request: EnqueueRequest) -> TaskFuture {
        if self.is_destroyed() {
            return TaskFuture::ready(Err(StoreError::destroyed()));
        }

        let EnqueueRequest {
            name,
            key,
            input,
            meta,
            scheduler,
            handler,
        } = request;
        let key = key.unwrap_or_else(|| name.clone());
        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (responder, receiver) = oneshot::channel();

        // 1. A queued task on this key never gets to start.
        let displaced = self.inner.slots.lock().shift_remove(&key);
        if let Some(displaced) = displaced {
            cov_mark::hit!(queued_task_superseded);
            tracing::trace!(task = %displaced.name, key = %key, "queued task superseded");
            displaced.reject(StoreError::superseded());
        }

        // 2. A running task on this key is told to stop; its record stays and
        //    settles as cancelled.
        let aborted = self
            .inner
            .abort_pending(|_, running_key| running_key == key, &StoreError::superseded());
        if aborted > 0 {
            tracing::trace!(key = %key, aborted, "pending task superseded");
        }

        // 3. Park in the slot, then schedule.
        self.inner.slots.lock().insert(
            key.clone(),
            Queued {
                id,
                name,
                input,
                meta,
                handler,
                responder,
                cancel: None,
            },
        );

        let scheduler = scheduler.unwrap_or_else(|| Arc::new(Microtask));
        let queue: Weak<QueueInner> = Arc::downgrade(&self.inner);
        let job_key = key.clone();
        let cancel = scheduler.schedule(Box::new(move || {
            if let Some(queue) = queue.upgrade() {
                queue.start(&job_key, id);
            }
        }));

        if let Some(cancel) = cancel {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(&key) {
                Some(queued) if queued.id == id => queued.cancel = Some(cancel),
                // Already started (or gone); nothing left to withdraw.
                _ => drop(cancel),
            }
        }

        TaskFuture::waiting(id, receiver)
    }

    /// Cancel queued and pending work for `name`, or for every name.
    pub fn abort(&self, name: Option<&str>) {
        let matches_name = |candidate: &str| name.is_none_or(|name| name == candidate);

        for queued in self.inner.take_queued(|queued| matches_name(&queued.name)) {
            queued.reject(StoreError::aborted());
        }
        self.inner
            .abort_pending(|running_name, _| matches_name(running_name), &StoreError::aborted());
    }

    /// Abort queued and pending work sharing `key`, whatever its name.
    pub fn abort_key(&self, key: &str, reason: StoreError) {
        let displaced = self.inner.slots.lock().shift_remove(key);
        if let Some(displaced) = displaced {
            displaced.reject(reason.clone());
        }
        self.inner.abort_pending(|_, running_key| running_key == key, &reason);
    }

    /// Clear settled records for `name`, or all settled records.
    ///
    /// Pending records are left alone. Subscribers are notified once.
    pub fn reset(&self, name: Option<&str>) {
        self.inner.tasks.modify(|record| {
            record.retain(|task_name, task| {
                task.is_pending() || name.is_some_and(|name| name != task_name.as_str())
            });
        });
    }

    /// Abort everything, clear all records and reject every future enqueue.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        for queued in self.inner.take_queued(|_| true) {
            queued.reject(StoreError::destroyed());
        }
        self.inner.abort_pending(|_, _| true, &StoreError::destroyed());
        self.inner.tasks.replace(Record::default());
        tracing::debug!("task queue destroyed");
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Current task records by request name.
    pub fn tasks(&self) -> Snapshot<Task> {
        self.inner.tasks.current()
    }

    /// The current record for one request name.
    pub fn task(&self, name: &str) -> Option<Task> {
        self.inner.tasks.get(name)
    }

    /// Number of tasks waiting for their scheduler.
    pub fn queued_len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Listen to task record changes.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Snapshot<Task>, &ChangeSet) + Send + Sync + 'static,
    {
        self.inner.tasks.subscribe(listener)
    }

    /// Listen to task record changes for specific request names.
    pub fn subscribe_names<I, K, F>(&self, names: I, listener: F) -> Subscription
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
        F: Fn(&Snapshot<Task>, &ChangeSet) + Send + Sync + 'static,
    {
        self.inner.tasks.subscribe_keys(names, listener)
    }

    /// Deliver pending task notifications now.
    pub fn flush(&self) {
        self.inner.tasks.flush();
    }
}
