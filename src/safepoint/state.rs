//! The poll word shared by mutators and the coordinator.

use crate::thread::{ThreadRecord, ThreadState};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Global poll flag plus the monitor threads block on.
///
/// The flag and every thread state use sequentially consistent ordering: a
/// thread publishes `RunningJava` before reading the flag and the
/// coordinator publishes the flag before reading thread states, so at least
/// one side always sees the other.
#[derive(Debug, Default)]
pub struct SafepointState {
    requested: AtomicBool,
    current_id: AtomicU64,
    lock: Mutex<()>,
    /// Signalled by threads that reached a safe state.
    progress: Condvar,
    /// Signalled when the safepoint ends.
    released: Condvar,
    polls: AtomicU64,
    hits: AtomicU64,
}

impl SafepointState {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Id of the most recently armed safepoint; 0 before the first one.
    pub fn current_id(&self) -> u64 {
        self.current_id.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub(crate) fn arm(&self) -> u64 {
        let _guard = self.lock.lock();
        let id = self.current_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.requested.store(true, Ordering::SeqCst);
        id
    }

    pub(crate) fn disarm(&self) {
        let _guard = self.lock.lock();
        self.requested.store(false, Ordering::SeqCst);
        self.released.notify_all();
    }

    pub(crate) fn notify_progress(&self) {
        let _guard = self.lock.lock();
        self.progress.notify_all();
    }

    pub(crate) fn wait_for_progress(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        self.progress.wait_for(&mut guard, timeout);
    }

    /// Safepoint poll for a thread running managed code.
    ///
    /// Returns immediately unless a safepoint or a suspension is pending.
    #[inline]
    pub(crate) fn poll(&self, record: &ThreadRecord) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        if record.state() != ThreadState::RunningJava {
            return;
        }
        if self.is_requested() || record.is_suspend_requested() {
            self.block(record);
        }
    }

    #[cold]
    fn block(&self, record: &ThreadRecord) {
        loop {
            let safepoint = self.is_requested();
            if !safepoint && !record.is_suspend_requested() {
                return;
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            let prior = record.transition(ThreadState::BlockedAtSafepoint, "safepoint poll");
            self.notify_progress();

            if safepoint {
                let mut guard = self.lock.lock();
                while self.is_requested() {
                    self.released.wait(&mut guard);
                }
            }

            if record.is_suspend_requested() {
                let mut guard = record.lock_monitor();
                if record.is_suspend_requested() {
                    record.set_suspended(true);
                    self.notify_progress();
                    tracing::debug!(thread = %record.id(), "thread suspended");
                    while record.is_suspend_requested() {
                        record.wait_on_monitor_forever(&mut guard);
                    }
                    record.set_suspended(false);
                    tracing::debug!(thread = %record.id(), "thread resumed");
                }
            }

            record.transition(prior, "safepoint poll");
        }
    }
}
