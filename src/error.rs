//! Error types shared by the store, the task queue and slice authors.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Operational error codes carried by [`StoreError::Operational`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Work was aborted explicitly (or by a signal with no specific reason).
    Aborted,
    /// Work was replaced by a newer request sharing its key.
    Superseded,
    /// Work was dropped without ever being settled.
    Removed,
    /// The store or queue has been destroyed.
    Destroyed,
    /// Caller-defined timeout. The core never raises this on its own.
    Timeout,
}

impl ErrorCode {
    /// Stable upper-case identifier, e.g. `"SUPERSEDED"`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::Superseded => "SUPERSEDED",
            ErrorCode::Removed => "REMOVED",
            ErrorCode::Destroyed => "DESTROYED",
            ErrorCode::Timeout => "TIMEOUT",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            ErrorCode::Aborted => "operation aborted",
            ErrorCode::Superseded => "operation superseded by a newer request",
            ErrorCode::Removed => "operation removed before it settled",
            ErrorCode::Destroyed => "store destroyed",
            ErrorCode::Timeout => "operation timed out",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by requests, tasks and lifecycle hooks.
///
/// `StoreError` is `Clone` because the same failure is delivered through two
/// channels: the awaited request future and the task record for that request.
#[derive(Clone, Debug, Error)]
pub enum StoreError {
    /// A request executed while no target was attached.
    #[error("no target attached")]
    NoTarget,

    /// A guard rejected the request, or its signal aborted while guards ran.
    #[error("request `{name}` was cancelled")]
    RequestCancelled {
        /// Name of the cancelled request.
        name: String,
    },

    /// Generic operational failure identified by a code.
    #[error("{} [{code}]", .code.describe())]
    Operational {
        /// What happened.
        code: ErrorCode,
    },

    /// The request name is not registered on the store.
    #[error("unknown request `{name}`")]
    UnknownRequest {
        /// The name that was looked up.
        name: String,
    },

    /// A handler or hook failed with its own error.
    #[error("{0}")]
    Handler(Arc<dyn StdError + Send + Sync>),

    /// A slice hook panicked; the panic was contained.
    #[error("hook panicked: {message}")]
    Panicked {
        /// Panic payload, if it was a string.
        message: String,
    },
}

#[derive(Debug, Error)]
#[error("{0}")]
struct MessageError(String);

impl StoreError {
    /// `ABORTED` operational error.
    pub fn aborted() -> Self {
        StoreError::Operational {
            code: ErrorCode::Aborted,
        }
    }

    /// `SUPERSEDED` operational error.
    pub fn superseded() -> Self {
        StoreError::Operational {
            code: ErrorCode::Superseded,
        }
    }

    /// `REMOVED` operational error.
    pub fn removed() -> Self {
        StoreError::Operational {
            code: ErrorCode::Removed,
        }
    }

    /// `DESTROYED` operational error.
    pub fn destroyed() -> Self {
        StoreError::Operational {
            code: ErrorCode::Destroyed,
        }
    }

    /// `TIMEOUT` operational error, for handlers that race their own timers.
    pub fn timeout() -> Self {
        StoreError::Operational {
            code: ErrorCode::Timeout,
        }
    }

    /// Wrap an arbitrary error raised by a handler or hook.
    pub fn handler<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        StoreError::Handler(Arc::new(err))
    }

    /// Build a handler error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        StoreError::Handler(Arc::new(MessageError(message.into())))
    }

    /// The operational code, if this is an [`StoreError::Operational`] error.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            StoreError::Operational { code } => Some(*code),
            _ => None,
        }
    }

    /// Whether this error means "the work did not run to completion because
    /// something cancelled it", as opposed to the work itself failing.
    pub fn is_cancellation(&self) -> bool {
        match self {
            StoreError::RequestCancelled { .. } => true,
            StoreError::Operational { code } => !matches!(code, ErrorCode::Timeout),
            _ => false,
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        StoreError::Panicked { message }
    }
}

/// Slices could not be composed into one store.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ComposeError {
    /// Two slices declare the same state key.
    #[error("state key `{key}` is declared by both `{first}` and `{second}`")]
    DuplicateStateKey {
        /// Colliding key.
        key: String,
        /// Slice that declared it first.
        first: String,
        /// Slice that declared it again.
        second: String,
    },

    /// Two slices declare the same request name.
    #[error("request `{name}` is declared by both `{first}` and `{second}`")]
    DuplicateRequest {
        /// Colliding request name.
        name: String,
        /// Slice that declared it first.
        first: String,
        /// Slice that declared it again.
        second: String,
    },
}

/// Lifecycle phase in which a contained failure happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookPhase {
    /// The store's `on_setup` hook.
    Setup,
    /// The store's `on_attach` hook.
    Attach,
    /// A slice `subscribe` function.
    Subscribe,
    /// A slice `snapshot` function.
    Snapshot,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HookPhase::Setup => "setup",
            HookPhase::Attach => "attach",
            HookPhase::Subscribe => "subscribe",
            HookPhase::Snapshot => "snapshot",
        })
    }
}

/// A failure caught at a lifecycle boundary and routed to the error sink.
#[derive(Clone, Debug, Error)]
#[error("{phase} hook failed{}: {error}", slice_suffix(.slice))]
pub struct HookError {
    /// Where it happened.
    pub phase: HookPhase,
    /// The slice involved, for slice hooks.
    pub slice: Option<String>,
    /// What went wrong.
    pub error: StoreError,
}

fn slice_suffix(slice: &Option<String>) -> String {
    slice
        .as_deref()
        .map(|name| format!(" in slice `{name}`"))
        .unwrap_or_default()
}
