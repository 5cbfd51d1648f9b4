//! Global safepoint coordination.
//!
//! A safepoint is a moment at which every VM thread is guaranteed not to be
//! touching the managed heap in a way the collector cares about. Requests
//! are served by a dedicated VM thread:
//!
//! 1. `Requested`: one or more requests are queued.
//! 2. `WaitingForThreads`: the global poll flag is armed. Under the
//!    counted-locker policy the locker gate is closed and the coordinator
//!    waits for every outstanding critical permit to be returned, then it
//!    waits until every registered thread is in a safe state.
//! 3. `Active`: the collector runs if any request asked for a collection,
//!    then each queued operation runs in request order.
//! 4. Threads are released and the phase returns to `Idle`.
//!
//! Requests that arrive while a synchronization is in flight form the next
//! batch. Threads cooperate through [`SafepointState`]: the poll word they
//! check on the fast path and the monitor they block on.
//!
//! # Examples
//!
//! ```
//! use vmsync::config::VmConfig;
//! use vmsync::safepoint::SafepointReason;
//! use vmsync::vm::Vm;
//!
//! let vm = Vm::new(VmConfig::default()).unwrap();
//! let outcome = vm
//!     .safepoints()
//!     .request_operation(SafepointReason::ThreadDump, |cx| {
//!         assert_eq!(cx.reasons(), &[SafepointReason::ThreadDump]);
//!     })
//!     .wait()
//!     .unwrap();
//! assert_eq!(outcome.batch_size, 1);
//! vm.shutdown();
//! ```

mod coordinator;
mod request;
mod state;
mod stats;


pub use coordinator::SafepointCoordinator;
pub use request::{RequestState, SafepointOperation, SafepointOutcome, SafepointRequest};
pub use state::SafepointState;
pub use stats::SafepointStats;

use crate::collector::GcCause;
use crate::policy::CollectorPolicy;
use crate::thread::{ThreadRecord, ThreadState, VmThreadId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Why a safepoint was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafepointReason {
    Collect(GcCause),
    ThreadDump,
    Deoptimize,
    Custom(String),
}

impl SafepointReason {
    pub fn needs_collection(&self) -> bool {
        matches!(self, SafepointReason::Collect(_))
    }
}

impl fmt::Display for SafepointReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafepointReason::Collect(cause) => write!(f, "collect ({cause})"),
            SafepointReason::ThreadDump => f.write_str("thread dump"),
            SafepointReason::Deoptimize => f.write_str("deoptimize"),
            SafepointReason::Custom(name) => f.write_str(name),
        }
    }
}

/// Coordinator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafepointPhase {
    Idle,
    Requested,
    WaitingForThreads,
    Active,
}

impl fmt::Display for SafepointPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SafepointPhase::Idle => "idle",
            SafepointPhase::Requested => "requested",
            SafepointPhase::WaitingForThreads => "waiting for threads",
            SafepointPhase::Active => "active",
        };
        f.write_str(name)
    }
}

/// Timing knobs for the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafepointSettings {
    /// Bound on waiting for every thread to reach a safe state.
    pub sync_timeout: Duration,
    /// Bound on waiting for the critical permit count to reach zero.
    pub locker_timeout: Duration,
    /// Turn a timeout into a fatal error instead of failing the requests.
    pub escalate_timeouts: bool,
    /// Rescan interval while waiting.
    pub poll_tick: Duration,
}

impl Default for SafepointSettings {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(10),
            locker_timeout: Duration::from_secs(10),
            escalate_timeouts: false,
            poll_tick: Duration::from_millis(1),
        }
    }
}

/// What the collector and safepoint operations see while threads are
/// quiesced.
#[derive(Debug)]
pub struct SafepointContext<'a> {
    id: u64,
    policy: CollectorPolicy,
    reasons: &'a [SafepointReason],
    threads: &'a [Arc<ThreadRecord>],
}

impl<'a> SafepointContext<'a> {
    pub(crate) fn new(
        id: u64,
        policy: CollectorPolicy,
        reasons: &'a [SafepointReason],
        threads: &'a [Arc<ThreadRecord>],
    ) -> Self {
        Self {
            id,
            policy,
            reasons,
            threads,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn policy(&self) -> CollectorPolicy {
        self.policy
    }

    /// Reasons of every live request in the batch, in request order.
    pub fn reasons(&self) -> &'a [SafepointReason] {
        self.reasons
    }

    /// Registered threads at the moment synchronization completed.
    pub fn threads(&self) -> &'a [Arc<ThreadRecord>] {
        self.threads
    }

    pub fn needs_collection(&self) -> bool {
        self.reasons.iter().any(SafepointReason::needs_collection)
    }
}

/// The step of synchronization that ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    /// Waiting for JNI critical permits to be returned.
    LockerRelease,
    /// Waiting for threads to reach a safe state.
    ThreadSync,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStage::LockerRelease => f.write_str("JNI critical regions to be released"),
            SyncStage::ThreadSync => f.write_str("threads to reach a safe state"),
        }
    }
}

/// A thread that kept a safepoint from synchronizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingThread {
    pub id: VmThreadId,
    pub name: String,
    pub state: ThreadState,
    pub critical_depth: u32,
}

impl BlockingThread {
    pub(crate) fn of(record: &ThreadRecord) -> Self {
        Self {
            id: record.id(),
            name: record.name().to_string(),
            state: record.state(),
            critical_depth: record.critical_depth(),
        }
    }

    pub fn diagnosis(&self) -> &'static str {
        if self.critical_depth > 0 {
            "still inside a JNI critical region"
        } else if self.state == ThreadState::RunningJava {
            "has not reached a safepoint poll"
        } else {
            "is not in a safe state"
        }
    }
}

impl fmt::Display for BlockingThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} \"{}\" {} depth={} ({})",
            self.id,
            self.name,
            self.state,
            self.critical_depth,
            self.diagnosis()
        )
    }
}

/// Diagnosis attached to a failed synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafepointTimeout {
    pub safepoint_id: u64,
    pub stage: SyncStage,
    pub waited: Duration,
    pub blocking: Vec<BlockingThread>,
}

impl fmt::Display for SafepointTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "safepoint {} timed out after {:?} waiting for {}",
            self.safepoint_id, self.waited, self.stage
        )?;
        if self.blocking.is_empty() {
            return f.write_str("; no blocking thread identified");
        }
        f.write_str("; blocking:")?;
        for (index, thread) in self.blocking.iter().enumerate() {
            let separator = if index == 0 { " " } else { ", " };
            write!(f, "{separator}{thread}")?;
        }
        Ok(())
    }
}
