//! JNI critical region tracking.
//!
//! Native code that obtains a direct pointer into a managed array enters a
//! critical region. What that means for the collector depends on the
//! [`CollectorPolicy`]:
//!
//! * `NonMoving`: nothing to do beyond counting depth.
//! * `RegionPinning`: the region named at entry is pinned until exit.
//! * `CountedLocker`: the outermost entry takes a permit on the GC-locker.
//!   A synchronizing safepoint closes the locker gate and waits for the
//!   permit count to reach zero; threads arriving at a closed gate block in
//!   `BlockedAtSafepoint` until it reopens.
//!
//! Entry and exit are driven by the owning thread. The coordinator only
//! touches the gate and waits on [`CriticalRegionTracker::wait_until_released`].

use crate::error::VmResult;
use crate::fatal::ImbalanceKind;
use crate::policy::CollectorPolicy;
use crate::safepoint::SafepointState;
use crate::thread::{ThreadRecord, ThreadRegistry, ThreadState, VmThreadId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifies a heap region a critical section touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u64);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region-{}", self.0)
    }
}

/// Outcome of waiting for the locker to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockerWait {
    Released,
    TimedOut,
    /// The waiter gave up on its own.
    Abandoned,
}

/// Counters kept by the tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CriticalStats {
    pub entries: u64,
    pub outermost_entries: u64,
    /// Outermost entries that found the locker gate closed.
    pub stalls: u64,
    /// Regions released on behalf of a thread that leaked them.
    pub leaked_regions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    entries: AtomicU64,
    outermost_entries: AtomicU64,
    stalls: AtomicU64,
    leaked_regions: AtomicU64,
}

/// The counted GC-locker: a gate the coordinator closes and a permit count
/// modified under the gate's mutex.
#[derive(Debug, Default)]
struct GcLocker {
    gate_closed: Mutex<bool>,
    changed: Condvar,
    active: AtomicUsize,
}

#[derive(Debug)]
pub struct CriticalRegionTracker {
    policy: CollectorPolicy,
    registry: Arc<ThreadRegistry>,
    safepoint: Arc<SafepointState>,
    locker: GcLocker,
    pins: DashMap<RegionId, usize>,
    counters: Counters,
}

impl CriticalRegionTracker {
    pub fn new(
        policy: CollectorPolicy,
        registry: Arc<ThreadRegistry>,
        safepoint: Arc<SafepointState>,
    ) -> Self {
        Self {
            policy,
            registry,
            safepoint,
            locker: GcLocker::default(),
            pins: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn policy(&self) -> CollectorPolicy {
        self.policy
    }

    /// Enter a critical region on behalf of the calling thread, which must
    /// own `thread`. Returns the new depth.
    pub fn enter_critical(&self, thread: VmThreadId) -> VmResult<u32> {
        let record = self.registry.lookup(thread)?;
        Ok(self.enter(&record, None))
    }

    /// Like [`enter_critical`](Self::enter_critical), naming the region the
    /// native code will touch.
    pub fn enter_critical_region(&self, thread: VmThreadId, region: RegionId) -> VmResult<u32> {
        let record = self.registry.lookup(thread)?;
        Ok(self.enter(&record, Some(region)))
    }

    /// Leave the innermost critical region. Returns the new depth.
    pub fn exit_critical(&self, thread: VmThreadId) -> VmResult<u32> {
        let record = self.registry.lookup(thread)?;
        Ok(self.exit(&record))
    }

    pub(crate) fn enter(&self, record: &ThreadRecord, region: Option<RegionId>) -> u32 {
        record.check_owner("enter_critical", ThreadState::InJniCritical);
        self.counters.entries.fetch_add(1, Ordering::Relaxed);

        let state = record.state();
        match state {
            ThreadState::InJniCritical => {
                self.pin(region);
                record.push_critical(region)
            }
            ThreadState::RunningJava | ThreadState::InNative => {
                self.counters.outermost_entries.fetch_add(1, Ordering::Relaxed);
                if self.policy.tracks_thread_status() {
                    self.acquire_permit(record, state);
                }
                self.pin(region);
                record.set_critical_return_state(state);
                let depth = record.push_critical(region);
                record.transition(ThreadState::InJniCritical, "enter_critical");
                tracing::trace!(thread = %record.id(), ?region, "entered critical region");
                depth
            }
            other => record.illegal_transition(other, ThreadState::InJniCritical, "enter_critical"),
        }
    }

    pub(crate) fn exit(&self, record: &ThreadRecord) -> u32 {
        record.check_owner("exit_critical", record.critical_return_state());
        let Some((region, depth)) = record.pop_critical() else {
            record.imbalance(ImbalanceKind::ExitWithoutEnter, "exit_critical")
        };
        self.unpin(region);
        if depth > 0 {
            return depth;
        }

        if record.holds_permit() {
            self.release_permit(record);
        }
        let back = record.critical_return_state();
        record.transition(back, "exit_critical");
        tracing::trace!(thread = %record.id(), to = %back, "left critical region");
        if back == ThreadState::RunningJava {
            self.safepoint.poll(record);
        }
        0
    }

    /// Drop every open region of a thread leaving native code without
    /// closing them. Only tolerated when no permit is involved.
    pub(crate) fn release_leaked(&self, record: &ThreadRecord) -> usize {
        let regions = record.drain_critical();
        let leaked = regions.len();
        for region in regions {
            self.unpin(region);
        }
        if record.holds_permit() {
            self.release_permit(record);
        }
        self.counters
            .leaked_regions
            .fetch_add(leaked as u64, Ordering::Relaxed);
        leaked
    }

    fn acquire_permit(&self, record: &ThreadRecord, state: ThreadState) {
        let mut closed = self.locker.gate_closed.lock();
        if *closed {
            self.counters.stalls.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(thread = %record.id(), "critical entry stalled on closed locker gate");
            record.transition(ThreadState::BlockedAtSafepoint, "enter_critical");
            self.safepoint.notify_progress();
            while *closed {
                self.locker.changed.wait(&mut closed);
            }
            record.transition(state, "enter_critical");
        }
        self.locker.active.fetch_add(1, Ordering::SeqCst);
        record.set_holds_permit(true);
    }

    fn release_permit(&self, record: &ThreadRecord) {
        let remaining = {
            let _gate = self.locker.gate_closed.lock();
            record.set_holds_permit(false);
            let remaining = self.locker.active.fetch_sub(1, Ordering::SeqCst) - 1;
            if remaining == 0 {
                self.locker.changed.notify_all();
            }
            remaining
        };
        if remaining == 0 {
            self.safepoint.notify_progress();
        }
    }

    fn pin(&self, region: Option<RegionId>) {
        if let (Some(region), true) = (region, self.policy.pins_regions()) {
            *self.pins.entry(region).or_insert(0) += 1;
        }
    }

    fn unpin(&self, region: Option<RegionId>) {
        let Some(region) = region else { return };
        if !self.policy.pins_regions() {
            return;
        }
        if let Entry::Occupied(mut entry) = self.pins.entry(region) {
            *entry.get_mut() -= 1;
            if *entry.get() == 0 {
                entry.remove();
            }
        }
    }

    // ---- coordinator side ---------------------------------------------------

    pub(crate) fn close_gate(&self) {
        *self.locker.gate_closed.lock() = true;
    }

    pub(crate) fn open_gate(&self) {
        let mut closed = self.locker.gate_closed.lock();
        if *closed {
            *closed = false;
            self.locker.changed.notify_all();
        }
    }

    /// Wait until no permit is held, giving up at `timeout` or as soon as
    /// `abandon` returns true.
    pub fn wait_until_released(
        &self,
        timeout: Duration,
        tick: Duration,
        abandon: impl Fn() -> bool,
    ) -> LockerWait {
        let deadline = Instant::now() + timeout;
        let mut gate = self.locker.gate_closed.lock();
        loop {
            if self.locker.active.load(Ordering::SeqCst) == 0 {
                return LockerWait::Released;
            }
            if abandon() {
                return LockerWait::Abandoned;
            }
            let now = Instant::now();
            if now >= deadline {
                return LockerWait::TimedOut;
            }
            self.locker
                .changed
                .wait_for(&mut gate, tick.min(deadline - now));
        }
    }

    // ---- inspection ---------------------------------------------------------

    /// Number of outstanding locker permits.
    pub fn active_critical_count(&self) -> usize {
        self.locker.active.load(Ordering::SeqCst)
    }

    pub fn is_gate_closed(&self) -> bool {
        *self.locker.gate_closed.lock()
    }

    pub fn is_pinned(&self, region: RegionId) -> bool {
        self.pins.contains_key(&region)
    }

    pub fn pin_count(&self, region: RegionId) -> usize {
        self.pins.get(&region).map(|count| *count).unwrap_or(0)
    }

    pub fn pinned_regions(&self) -> Vec<RegionId> {
        let mut regions: Vec<_> = self.pins.iter().map(|entry| *entry.key()).collect();
        regions.sort_unstable();
        regions
    }

    pub fn stats(&self) -> CriticalStats {
        CriticalStats {
            entries: self.counters.entries.load(Ordering::Relaxed),
            outermost_entries: self.counters.outermost_entries.load(Ordering::Relaxed),
            stalls: self.counters.stalls.load(Ordering::Relaxed),
            leaked_regions: self.counters.leaked_regions.load(Ordering::Relaxed),
        }
    }
}
