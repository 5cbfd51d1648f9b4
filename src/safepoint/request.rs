use super::coordinator::CoordinatorCore;
use super::{SafepointContext, SafepointReason};
use crate::error::{VmError, VmResult};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Work run on the VM thread while the safepoint is active.
pub type SafepointOperation = Box<dyn FnOnce(&SafepointContext<'_>) + Send + 'static>;

/// What every requester of one physical safepoint receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafepointOutcome {
    pub safepoint_id: u64,
    /// Requests served by this safepoint, cancelled ones excluded.
    pub batch_size: usize,
    pub time_to_safepoint: Duration,
    /// Time from arming the poll flag to releasing threads.
    pub duration: Duration,
    pub collected: bool,
}

/// Observable lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    Synchronizing,
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug)]
enum Status {
    Queued,
    Synchronizing,
    Active,
    Completed(VmResult<SafepointOutcome>),
    Cancelled,
}

pub(super) struct RequestSlot {
    seq: u64,
    reason: SafepointReason,
    operation: Mutex<Option<SafepointOperation>>,
    status: Mutex<Status>,
    done: Condvar,
}

impl RequestSlot {
    pub(super) fn new(seq: u64, reason: SafepointReason, operation: Option<SafepointOperation>) -> Self {
        Self {
            seq,
            reason,
            operation: Mutex::new(operation),
            status: Mutex::new(Status::Queued),
            done: Condvar::new(),
        }
    }

    pub(super) fn seq(&self) -> u64 {
        self.seq
    }

    pub(super) fn reason(&self) -> &SafepointReason {
        &self.reason
    }

    pub(super) fn take_operation(&self) -> Option<SafepointOperation> {
        self.operation.lock().take()
    }

    pub(super) fn state(&self) -> RequestState {
        match *self.status.lock() {
            Status::Queued => RequestState::Queued,
            Status::Synchronizing => RequestState::Synchronizing,
            Status::Active => RequestState::Active,
            Status::Completed(_) => RequestState::Completed,
            Status::Cancelled => RequestState::Cancelled,
        }
    }

    pub(super) fn is_cancelled(&self) -> bool {
        matches!(*self.status.lock(), Status::Cancelled)
    }

    pub(super) fn begin_sync(&self) {
        let mut status = self.status.lock();
        if matches!(*status, Status::Queued) {
            *status = Status::Synchronizing;
        }
    }

    /// Move to `Active` unless the request was withdrawn.
    pub(super) fn activate(&self) -> bool {
        let mut status = self.status.lock();
        if matches!(*status, Status::Synchronizing) {
            *status = Status::Active;
            true
        } else {
            false
        }
    }

    pub(super) fn cancel(&self) {
        let mut status = self.status.lock();
        *status = Status::Cancelled;
        drop(self.operation.lock().take());
        self.done.notify_all();
    }

    /// Publish the result. Cancelled requests keep their state.
    pub(super) fn complete(&self, result: VmResult<SafepointOutcome>) {
        let mut status = self.status.lock();
        if matches!(*status, Status::Cancelled) {
            return;
        }
        *status = Status::Completed(result);
        self.done.notify_all();
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Option<VmResult<SafepointOutcome>> {
        let mut status = self.status.lock();
        loop {
            match &*status {
                Status::Completed(result) => return Some(result.clone()),
                Status::Cancelled => return Some(Err(VmError::SafepointCancelled)),
                _ => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut status, deadline).timed_out() {
                        return match &*status {
                            Status::Completed(result) => Some(result.clone()),
                            Status::Cancelled => Some(Err(VmError::SafepointCancelled)),
                            _ => None,
                        };
                    }
                }
                None => self.done.wait(&mut status),
            }
        }
    }
}

/// Handle returned to a requester.
///
/// A requester that is itself an attached thread running managed code must
/// not block in [`wait`](Self::wait) without first leaving managed state,
/// or the safepoint it waits for can never synchronize.
/// `JavaThread::request_safepoint` takes care of that.
pub struct SafepointRequest {
    slot: Arc<RequestSlot>,
    core: Arc<CoordinatorCore>,
}

impl SafepointRequest {
    pub(super) fn new(slot: Arc<RequestSlot>, core: Arc<CoordinatorCore>) -> Self {
        Self { slot, core }
    }

    /// Position in the global request order.
    pub fn seq(&self) -> u64 {
        self.slot.seq()
    }

    pub fn reason(&self) -> &SafepointReason {
        self.slot.reason()
    }

    pub fn state(&self) -> RequestState {
        self.slot.state()
    }

    /// Block until the safepoint serving this request has finished.
    pub fn wait(&self) -> VmResult<SafepointOutcome> {
        match self.slot.wait_until(None) {
            Some(result) => result,
            None => Err(VmError::SafepointCancelled),
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<VmResult<SafepointOutcome>> {
        self.slot.wait_until(Some(Instant::now() + timeout))
    }

    /// Withdraw the request. Fails once the safepoint is active.
    pub fn cancel(&self) -> VmResult<()> {
        self.core.cancel(&self.slot)
    }
}

impl fmt::Debug for SafepointRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafepointRequest")
            .field("seq", &self.slot.seq())
            .field("reason", self.slot.reason())
            .field("state", &self.slot.state())
            .finish()
    }
}
