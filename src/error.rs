//! Recoverable error types for the vmsync runtime.
//!
//! Misuse of the registry, the suspend controller or the safepoint API is
//! reported through [`VmError`] and surfaced to the immediate caller.
//! Invariant violations that put memory safety at risk never show up here;
//! they go through [`crate::fatal`] and terminate the process.

use crate::safepoint::SafepointTimeout;
use crate::thread::VmThreadId;
use std::any::Any;
use thiserror::Error;

/// Errors returned by vmsync operations.
///
/// # Examples
///
/// ```
/// use vmsync::error::{VmError, VmResult};
/// use vmsync::thread::VmThreadId;
///
/// let err = VmError::UnknownThread(VmThreadId::new(7));
/// assert_eq!(err.to_string(), "unknown thread #7");
///
/// let ok: VmResult<u32> = Ok(1);
/// assert!(ok.is_ok());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("thread {0} is already registered")]
    DuplicateRegistration(VmThreadId),
    #[error("thread id {0} was already issued")]
    IdReused(VmThreadId),
    #[error("thread id {0} leaves no room for further ids")]
    IdOutOfRange(VmThreadId),
    #[error("unknown thread {0}")]
    UnknownThread(VmThreadId),
    #[error("{0}")]
    SafepointTimeout(SafepointTimeout),
    #[error("safepoint request was cancelled")]
    SafepointCancelled,
    #[error("safepoint is already active and can no longer be cancelled")]
    CancelTooLate,
    #[error("priority {0} is outside the range 1..=10")]
    InvalidPriority(i32),
    #[error("thread {0} is already suspended")]
    AlreadySuspended(VmThreadId),
    #[error("thread {0} is not suspended")]
    NotSuspended(VmThreadId),
    #[error("{operation} on thread {thread} is restricted to its owning thread")]
    NotOwner {
        thread: VmThreadId,
        operation: &'static str,
    },
    #[error("the VM is already initialized")]
    AlreadyInitialized,
    #[error("the VM is not initialized")]
    NotInitialized,
    #[error("the VM is shutting down")]
    ShutDown,
    #[error("safepoint operation panicked: {0}")]
    OperationPanicked(String),
    #[error("virtual thread {thread} panicked: {message}")]
    VirtualThreadPanicked { thread: VmThreadId, message: String },
    #[error("failed to spawn thread: {0}")]
    Spawn(String),
    #[error("invalid signal number {0}")]
    InvalidSignal(i32),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for vmsync operations
pub type VmResult<T> = Result<T, VmError>;

impl From<SafepointTimeout> for VmError {
    fn from(timeout: SafepointTimeout) -> Self {
        VmError::SafepointTimeout(timeout)
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
