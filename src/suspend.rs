//! External suspension of VM threads.
//!
//! `suspend` only raises a flag. The target halts itself at its next poll
//! point (an explicit poll, a return from native code or the exit of its
//! outermost critical region) and waits in `BlockedAtSafepoint` until
//! resumed. A thread inside a critical region therefore keeps running until
//! it leaves the region.

use crate::error::{VmError, VmResult};
use crate::safepoint::SafepointState;
use crate::thread::{ThreadRegistry, ThreadState, VmThreadId};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct SuspendController {
    registry: Arc<ThreadRegistry>,
    safepoint: Arc<SafepointState>,
    tick: Duration,
}

impl SuspendController {
    pub fn new(registry: Arc<ThreadRegistry>, safepoint: Arc<SafepointState>, tick: Duration) -> Self {
        Self {
            registry,
            safepoint,
            tick,
        }
    }

    /// Request suspension. Never blocks.
    pub fn suspend(&self, thread: VmThreadId) -> VmResult<()> {
        let record = self.registry.lookup(thread)?;
        if record.set_suspend_requested(true) {
            return Err(VmError::AlreadySuspended(thread));
        }
        tracing::debug!(thread = %thread, state = %record.state(), "suspend requested");
        Ok(())
    }

    pub fn resume(&self, thread: VmThreadId) -> VmResult<()> {
        let record = self.registry.lookup(thread)?;
        if !record.set_suspend_requested(false) {
            return Err(VmError::NotSuspended(thread));
        }
        record.notify();
        tracing::debug!(thread = %thread, "resume requested");
        Ok(())
    }

    pub fn is_suspend_requested(&self, thread: VmThreadId) -> VmResult<bool> {
        Ok(self.registry.lookup(thread)?.is_suspend_requested())
    }

    /// True while the thread is actually halted.
    pub fn is_suspended(&self, thread: VmThreadId) -> VmResult<bool> {
        Ok(self.registry.lookup(thread)?.is_suspended())
    }

    /// Threads with a pending or effective suspension, ordered by id.
    pub fn suspended_threads(&self) -> Vec<VmThreadId> {
        self.registry
            .snapshot()
            .iter()
            .filter(|record| record.is_suspend_requested())
            .map(|record| record.id())
            .collect()
    }

    /// Wait until a suspended thread can no longer run managed code: it
    /// halted at a poll point, or it sits in native code or unmounted.
    ///
    /// Returns `false` on timeout or when the suspension is withdrawn.
    pub fn wait_for_suspension(&self, thread: VmThreadId, timeout: Duration) -> VmResult<bool> {
        let record = self.registry.lookup(thread)?;
        let deadline = Instant::now() + timeout;
        loop {
            if !record.is_suspend_requested() {
                return Ok(false);
            }
            if record.is_suspended()
                || matches!(
                    record.state(),
                    ThreadState::InNative | ThreadState::Parked | ThreadState::New
                )
            {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.safepoint.wait_for_progress(self.tick.min(deadline - now));
        }
    }
}
