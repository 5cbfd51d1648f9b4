//! Fatal invariant violations.
//!
//! A thread leaving native code inside a critical region, or any illegal
//! state transition, means a collector could move memory that native code
//! still dereferences. Nothing in-process can recover from that, so these
//! conditions never surface as `Result`s: the reporter writes a diagnostic
//! dump and terminates according to the configured [`FatalAction`].

use crate::safepoint::SafepointTimeout;
use crate::thread::{ThreadKind, ThreadState, VmThreadId};
use std::backtrace::Backtrace;
use std::fmt;
use std::io::Write;
use thiserror::Error;

/// What the reporter does after writing the diagnostic dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalAction {
    /// `std::process::abort()`, the production default.
    #[default]
    Abort,
    /// `std::process::exit(code)`.
    Exit(i32),
    /// Panic with the error message. Used by in-process tests.
    Panic,
}

/// Point-in-time view of the offending thread, captured when the violation
/// is detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub id: VmThreadId,
    pub name: String,
    pub kind: ThreadKind,
    pub state: ThreadState,
    pub critical_depth: u32,
    pub suspend_requested: bool,
}

impl fmt::Display for ThreadSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "thread {} \"{}\" ({}, state={}, critical_depth={})",
            self.id, self.name, self.kind, self.state, self.critical_depth
        )
    }
}

/// The ways a thread can break critical-region nesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImbalanceKind {
    LeavingNative,
    ReenteringNative,
    ExitWithoutEnter,
    Terminating,
    Unmounting,
}

impl fmt::Display for ImbalanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            ImbalanceKind::LeavingNative => {
                "Leaving native code while in JNI critical section, potential deadlock"
            }
            ImbalanceKind::ReenteringNative => {
                "Entering native code while in JNI critical section, potential deadlock"
            }
            ImbalanceKind::ExitWithoutEnter => "JNI critical exit without a matching enter",
            ImbalanceKind::Terminating => {
                "Thread terminating while in JNI critical section, potential deadlock"
            }
            ImbalanceKind::Unmounting => {
                "Virtual thread unmounting while in JNI critical section, potential deadlock"
            }
        };
        f.write_str(message)
    }
}

/// Conditions that terminate the process.
#[derive(Error, Debug, Clone)]
pub enum FatalError {
    #[error("Illegal state transition {from} -> {to} in {operation} on {thread}: {detail}")]
    IllegalStateTransition {
        thread: ThreadSnapshot,
        from: ThreadState,
        to: ThreadState,
        operation: &'static str,
        detail: &'static str,
    },
    #[error("{kind} ({operation} on {thread})")]
    CriticalRegionImbalance {
        thread: ThreadSnapshot,
        kind: ImbalanceKind,
        operation: &'static str,
    },
    #[error("{0}")]
    SafepointTimeout(SafepointTimeout),
}

impl FatalError {
    pub fn thread(&self) -> Option<&ThreadSnapshot> {
        match self {
            FatalError::IllegalStateTransition { thread, .. }
            | FatalError::CriticalRegionImbalance { thread, .. } => Some(thread),
            FatalError::SafepointTimeout(_) => None,
        }
    }
}

/// Writes the diagnostic dump and applies the configured action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FatalReporter {
    action: FatalAction,
}

impl FatalReporter {
    pub const fn new(action: FatalAction) -> Self {
        Self { action }
    }

    pub fn action(&self) -> FatalAction {
        self.action
    }

    /// Report `error` and never return.
    #[cold]
    pub fn report(&self, error: FatalError) -> ! {
        let dump = render_dump(&error);
        tracing::error!(target: "vmsync::fatal", error = %error, "fatal error detected");

        match self.action {
            FatalAction::Panic => {
                eprint!("{dump}");
                panic!("{error}");
            }
            FatalAction::Exit(code) => {
                write_stderr(&dump);
                std::process::exit(code);
            }
            FatalAction::Abort => {
                write_stderr(&dump);
                std::process::abort();
            }
        }
    }
}

fn write_stderr(dump: &str) {
    let mut stderr = std::io::stderr().lock();
    let _ = stderr.write_all(dump.as_bytes());
    let _ = stderr.flush();
}

/// Render the dump printed before termination.
pub fn render_dump(error: &FatalError) -> String {
    let mut out = String::new();
    out.push_str("#\n# A fatal error has been detected by the vmsync runtime:\n#\n");
    out.push_str(&format!("#  {error}\n#\n"));
    match error.thread() {
        Some(thread) => out.push_str(&format!(
            "# Current thread: {} \"{}\" {}, state={}, critical_depth={}, suspend_requested={}\n#\n",
            thread.id,
            thread.name,
            thread.kind,
            thread.state,
            thread.critical_depth,
            thread.suspend_requested
        )),
        None => out.push_str("# Current thread: VM Thread\n#\n"),
    }
    out.push_str("Stack:\n");
    out.push_str(&Backtrace::force_capture().to_string());
    out.push('\n');
    out
}
