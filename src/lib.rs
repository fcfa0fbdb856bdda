#![deny(missing_docs)]

//! Reactive state for externally owned targets, with batched notifications
//! and keyed, cancellable requests.
//!
//! A [`Store`] binds to one long-lived target (a media element, a device
//! handle, anything your code does not own) and keeps a flat, observable
//! snapshot of its state. State is contributed by [`Slice`]s; mutations go
//! through named [`Request`]s executed by a [`TaskQueue`] that cancels older
//! work sharing a key with newer work.
//!
//! # Quick Start
//!
//! ```ignore
//! use tether::{Request, RequestContext, Slice, Store};
//! use serde_json::json;
//!
//! let volume = Slice::<Media>::new("volume")
//!     .state([("volume", json!(1.0))])
//!     .snapshot(|cx| Ok([("volume".into(), json!(cx.target.volume()))].into_iter().collect()))
//!     .subscribe(|cx| {
//!         let updater = cx.updater;
//!         cx.target.on("volumechange", &cx.signal, move |_| updater.update());
//!         Ok(())
//!     })
//!     .request("changeVolume", Request::from_fn(|input, cx: RequestContext<Media>| {
//!         let v = input.as_f64().unwrap_or(1.0).clamp(0.0, 1.0);
//!         cx.target.set_volume(v);
//!         Ok(json!(v))
//!     }));
//!
//! let store = Store::builder().slice(volume).build()?;
//! let _detach = store.attach(media);
//!
//! let _sub = store.subscribe_keys(["volume"], |state, _changed| {
//!     println!("volume is now {}", state["volume"]);
//! });
//!
//! store.request("changeVolume", json!(1.5)).await?; // resolves with 1.0
//! ```
//!
//! # Core Types
//!
//! - [`StateContainer`] - Flat record with coalesced, net-change notifications.
//! - [`Slice`] - Initial state, snapshot, subscribe and requests for one concern.
//! - [`Store`] - Attach/detach/destroy lifecycle plus the request proxy.
//! - [`TaskQueue`] - Keyed supersession and observable [`Task`] records.
//! - [`AbortController`] / [`AbortSignal`] - Scoped cancellation.
//! - [`Transaction`] - Batch changes across containers into one notification each.
//!
//! # Notifications
//!
//! ```ignore
//! state.set("volume", json!(0.5));
//! state.set("volume", json!(1.0));  // back to where it started
//! state.flush();                    // nobody is notified: the net change is empty
//! ```
//!
//! Inside a tokio runtime the flush happens on its own once the current task
//! yields. Without a runtime, call [`StateContainer::flush`] (or
//! [`Store::flush`]).
//!
//! # Supersession
//!
//! ```ignore
//! // play and pause share the "playback" key
//! let play = store.request("play", Value::Null);
//! let pause = store.request("pause", Value::Null);
//!
//! assert!(play.await.unwrap_err().is_cancellation()); // SUPERSEDED
//! pause.await?;
//! ```
//!
//! # Runtime
//!
//! Requests and automatic flushing need a tokio runtime. The ordering
//! guarantees are those of a single-threaded cooperative scheduler, which is
//! what the current-thread runtime provides.

// Internal modules
mod abort;
mod arena;
mod emitter;
mod error;
mod hash;
mod queue;
mod schedule;
mod slice;
mod state;
mod store;
mod transaction;

#[cfg(test)]
mod testing;

// Core types
pub use abort::{AbortController, AbortRegistration, AbortSignal};
pub use arena::{NodeId, ReactiveTree};
pub use emitter::{EventEmitter, Listener};
pub use error::{ComposeError, ErrorCode, HookError, HookPhase, StoreError};
pub use hash::{FastHashBuilder, FastIndexMap, FastIndexSet};
pub use queue::{
    EnqueueRequest, Task, TaskFuture, TaskHandler, TaskId, TaskOutput, TaskPhase, TaskQueue,
    TaskStatus,
};
pub use schedule::{CancelSchedule, Debounce, Job, Microtask, Scheduler};
pub use slice::{
    ComposedSlices, Guard, GuardContext, Request, RequestContext, RequestKey, RequestMeta, Slice,
    SnapshotContext, SubscribeContext, Updater, compose,
};
pub use state::{
    ChangeSet, Record, Snapshot, StateContainer, Subscription, record_from_json, record_to_json,
};
pub use store::{AttachContext, Detach, Requester, SetupContext, Store, StoreBuilder};
pub use transaction::{Transaction, is_transaction_active};

#[cfg(test)]
mod tests;
