//! Per-thread bookkeeping shared between the owning thread and the VM.

use super::{Priority, ThreadDescriptor, ThreadKind, ThreadState, VmThreadId};
use crate::critical::RegionId;
use crate::fatal::{FatalError, FatalReporter, ImbalanceKind, ThreadSnapshot};
use crate::signal::SignalSet;
use crossbeam_utils::atomic::AtomicCell;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// One live VM thread.
///
/// The registry owns the record's existence. `state` and `critical_depth`
/// are written only by the owning OS thread and read by everyone else; the
/// crate-private mutators check ownership and report a fatal error when
/// another thread tries to drive the record.
pub struct ThreadRecord {
    id: VmThreadId,
    name: String,
    kind: ThreadKind,
    daemon: bool,
    created: Instant,
    priority: AtomicU8,
    state: AtomicU8,
    /// State to restore when the outermost critical region is left.
    critical_return: AtomicU8,
    critical_depth: AtomicU32,
    /// Region pinned by each open critical entry, innermost last.
    critical_regions: Mutex<Vec<Option<RegionId>>>,
    holds_permit: AtomicBool,
    suspend_requested: AtomicBool,
    suspended: AtomicBool,
    interrupted: AtomicBool,
    signal_mask: AtomicU64,
    pending_signals: AtomicU64,
    owner: AtomicCell<Option<thread::ThreadId>>,
    carrier: AtomicCell<Option<VmThreadId>>,
    monitor: Mutex<()>,
    wakeup: Condvar,
    fatal: FatalReporter,
}

impl ThreadRecord {
    pub(crate) fn new(id: VmThreadId, descriptor: ThreadDescriptor, fatal: FatalReporter) -> Self {
        let owner = match descriptor.kind {
            ThreadKind::Platform => Some(thread::current().id()),
            ThreadKind::Virtual => None,
        };
        Self {
            id,
            name: descriptor.name,
            kind: descriptor.kind,
            daemon: descriptor.daemon,
            created: Instant::now(),
            priority: AtomicU8::new(descriptor.priority.raw()),
            state: AtomicU8::new(ThreadState::New as u8),
            critical_return: AtomicU8::new(ThreadState::RunningJava as u8),
            critical_depth: AtomicU32::new(0),
            critical_regions: Mutex::new(Vec::new()),
            holds_permit: AtomicBool::new(false),
            suspend_requested: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            signal_mask: AtomicU64::new(descriptor.signal_mask.bits()),
            pending_signals: AtomicU64::new(0),
            owner: AtomicCell::new(owner),
            carrier: AtomicCell::new(None),
            monitor: Mutex::new(()),
            wakeup: Condvar::new(),
            fatal,
        }
    }

    pub fn id(&self) -> VmThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn priority(&self) -> Priority {
        Priority::from_raw(self.priority.load(Ordering::SeqCst))
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        self.priority.store(priority.raw(), Ordering::SeqCst);
    }

    pub fn state(&self) -> ThreadState {
        decode_state(self.state.load(Ordering::SeqCst))
    }

    pub fn critical_depth(&self) -> u32 {
        self.critical_depth.load(Ordering::SeqCst)
    }

    pub fn is_suspend_requested(&self) -> bool {
        self.suspend_requested.load(Ordering::SeqCst)
    }

    /// True while the thread is actually halted by a suspension.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn signal_mask(&self) -> SignalSet {
        SignalSet::from_bits_retain(self.signal_mask.load(Ordering::SeqCst))
    }

    pub fn pending_signals(&self) -> SignalSet {
        SignalSet::from_bits_retain(self.pending_signals.load(Ordering::SeqCst))
    }

    /// Carrier a virtual thread is currently mounted on.
    pub fn carrier(&self) -> Option<VmThreadId> {
        self.carrier.load()
    }

    pub fn is_owned_by_current_thread(&self) -> bool {
        self.owner.load() == Some(thread::current().id())
    }

    pub fn snapshot(&self) -> ThreadSnapshot {
        ThreadSnapshot {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            state: self.state(),
            critical_depth: self.critical_depth(),
            suspend_requested: self.is_suspend_requested(),
        }
    }

    // ---- owner-side mutation ------------------------------------------------

    /// Fatal unless the calling OS thread owns this record.
    pub(crate) fn check_owner(&self, operation: &'static str, to: ThreadState) {
        if !self.is_owned_by_current_thread() {
            self.fatal.report(FatalError::IllegalStateTransition {
                thread: self.snapshot(),
                from: self.state(),
                to,
                operation,
                detail: "only the owning thread may change its state",
            });
        }
    }

    /// Move to `to` after checking ownership and the transition table.
    pub(crate) fn transition(&self, to: ThreadState, operation: &'static str) -> ThreadState {
        self.check_owner(operation, to);
        let from = self.state();
        if !from.can_transition_to(to) {
            self.illegal_transition(from, to, operation);
        }
        self.state.store(to as u8, Ordering::SeqCst);
        tracing::trace!(thread = %self.id, %from, %to, operation, "state transition");
        from
    }

    /// Store without consulting the table. Callers have validated the move.
    pub(crate) fn force_state(&self, to: ThreadState) {
        self.state.store(to as u8, Ordering::SeqCst);
    }

    #[cold]
    pub(crate) fn illegal_transition(
        &self,
        from: ThreadState,
        to: ThreadState,
        operation: &'static str,
    ) -> ! {
        self.fatal.report(FatalError::IllegalStateTransition {
            thread: self.snapshot(),
            from,
            to,
            operation,
            detail: "transition is not permitted",
        })
    }

    #[cold]
    pub(crate) fn imbalance(&self, kind: ImbalanceKind, operation: &'static str) -> ! {
        self.fatal.report(FatalError::CriticalRegionImbalance {
            thread: self.snapshot(),
            kind,
            operation,
        })
    }

    pub(crate) fn critical_return_state(&self) -> ThreadState {
        decode_state(self.critical_return.load(Ordering::SeqCst))
    }

    pub(crate) fn set_critical_return_state(&self, state: ThreadState) {
        self.critical_return.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn push_critical(&self, region: Option<RegionId>) -> u32 {
        self.critical_regions.lock().push(region);
        self.critical_depth.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Pop the innermost entry. `None` when depth is already zero.
    pub(crate) fn pop_critical(&self) -> Option<(Option<RegionId>, u32)> {
        let mut regions = self.critical_regions.lock();
        let region = regions.pop()?;
        let depth = self.critical_depth.fetch_sub(1, Ordering::SeqCst) - 1;
        Some((region, depth))
    }

    /// Drop every open entry, returning the pinned regions.
    pub(crate) fn drain_critical(&self) -> Vec<Option<RegionId>> {
        let mut regions = self.critical_regions.lock();
        self.critical_depth.store(0, Ordering::SeqCst);
        std::mem::take(&mut *regions)
    }

    pub(crate) fn holds_permit(&self) -> bool {
        self.holds_permit.load(Ordering::SeqCst)
    }

    pub(crate) fn set_holds_permit(&self, value: bool) {
        self.holds_permit.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_suspend_requested(&self, value: bool) -> bool {
        self.suspend_requested.swap(value, Ordering::SeqCst)
    }

    pub(crate) fn set_suspended(&self, value: bool) {
        self.suspended.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_interrupted(&self, value: bool) -> bool {
        self.interrupted.swap(value, Ordering::SeqCst)
    }

    pub(crate) fn store_signal_mask(&self, mask: SignalSet) -> SignalSet {
        SignalSet::from_bits_retain(self.signal_mask.swap(mask.bits(), Ordering::SeqCst))
    }

    pub(crate) fn add_pending_signals(&self, signals: SignalSet) {
        self.pending_signals.fetch_or(signals.bits(), Ordering::SeqCst);
    }

    /// Remove and return pending signals not blocked by the mask.
    pub(crate) fn take_deliverable_signals(&self) -> SignalSet {
        let mask = self.signal_mask.load(Ordering::SeqCst);
        let taken = self.pending_signals.fetch_and(mask, Ordering::SeqCst);
        SignalSet::from_bits_retain(taken & !mask)
    }

    pub(crate) fn bind_owner(&self, owner: Option<thread::ThreadId>) {
        self.owner.store(owner);
    }

    pub(crate) fn set_carrier(&self, carrier: Option<VmThreadId>) {
        self.carrier.store(carrier);
    }

    /// Lock the per-thread monitor used for suspension and sleeps.
    pub(crate) fn lock_monitor(&self) -> MutexGuard<'_, ()> {
        self.monitor.lock()
    }

    pub(crate) fn wait_on_monitor(&self, guard: &mut MutexGuard<'_, ()>, timeout: Duration) {
        self.wakeup.wait_for(guard, timeout);
    }

    pub(crate) fn wait_on_monitor_forever(&self, guard: &mut MutexGuard<'_, ()>) {
        self.wakeup.wait(guard);
    }

    /// Wake anything waiting on this thread's monitor.
    pub(crate) fn notify(&self) {
        let _guard = self.monitor.lock();
        self.wakeup.notify_all();
    }
}

fn decode_state(raw: u8) -> ThreadState {
    match raw {
        0 => ThreadState::New,
        1 => ThreadState::RunningJava,
        2 => ThreadState::InNative,
        3 => ThreadState::InJniCritical,
        4 => ThreadState::BlockedAtSafepoint,
        5 => ThreadState::Parked,
        _ => ThreadState::Terminated,
    }
}

impl fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("critical_depth", &self.critical_depth())
            .field("priority", &self.priority())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fatal::FatalAction;

    fn record(kind: ThreadKind) -> ThreadRecord {
        let descriptor = match kind {
            ThreadKind::Platform => ThreadDescriptor::platform("t"),
            ThreadKind::Virtual => ThreadDescriptor::virtual_thread("v"),
        };
        ThreadRecord::new(
            VmThreadId::new(1),
            descriptor,
            FatalReporter::new(FatalAction::Panic),
        )
    }

    #[test]
    fn state_encoding_round_trips() {
        for state in [
            ThreadState::New,
            ThreadState::RunningJava,
            ThreadState::InNative,
            ThreadState::InJniCritical,
            ThreadState::BlockedAtSafepoint,
            ThreadState::Parked,
            ThreadState::Terminated,
        ] {
            assert_eq!(decode_state(state as u8), state);
        }
    }

    #[test]
    fn platform_record_is_owned_by_registering_thread() {
        let record = record(ThreadKind::Platform);
        assert!(record.is_owned_by_current_thread());
        assert_eq!(record.state(), ThreadState::New);
    }

    #[test]
    fn virtual_record_starts_unowned() {
        let record = record(ThreadKind::Virtual);
        assert!(!record.is_owned_by_current_thread());
        assert_eq!(record.carrier(), None);
    }

    #[test]
    #[should_panic(expected = "only the owning thread")]
    fn foreign_thread_cannot_transition() {
        let record = std::sync::Arc::new(record(ThreadKind::Platform));
        let clone = std::sync::Arc::clone(&record);
        let result = std::thread::spawn(move || {
            clone.transition(ThreadState::RunningJava, "start");
        })
        .join();
        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
    }

    #[test]
    #[should_panic(expected = "IN_JNI_CRITICAL -> TERMINATED")]
    fn table_violation_is_fatal() {
        let record = record(ThreadKind::Platform);
        record.transition(ThreadState::RunningJava, "start");
        record.transition(ThreadState::InJniCritical, "enter_critical");
        record.transition(ThreadState::Terminated, "detach");
    }

    #[test]
    fn deliverable_signals_respect_mask() {
        let record = record(ThreadKind::Platform);
        record.store_signal_mask(SignalSet::SIGUSR1);
        record.add_pending_signals(SignalSet::SIGUSR1 | SignalSet::SIGUSR2);

        assert_eq!(record.take_deliverable_signals(), SignalSet::SIGUSR2);
        assert_eq!(record.pending_signals(), SignalSet::SIGUSR1);

        record.store_signal_mask(SignalSet::empty());
        assert_eq!(record.take_deliverable_signals(), SignalSet::SIGUSR1);
        assert!(record.pending_signals().is_empty());
    }

    #[test]
    fn critical_stack_tracks_depth() {
        let record = record(ThreadKind::Platform);
        assert_eq!(record.push_critical(Some(RegionId(3))), 1);
        assert_eq!(record.push_critical(None), 2);
        assert_eq!(record.pop_critical(), Some((None, 1)));
        assert_eq!(record.pop_critical(), Some((Some(RegionId(3)), 0)));
        assert_eq!(record.pop_critical(), None);
        assert_eq!(record.critical_depth(), 0);
    }
}
