//! The VM thread and its request queue.

use super::request::{RequestSlot, RequestState};
use super::stats::StatsRecorder;
use super::{
    BlockingThread, SafepointContext, SafepointOperation, SafepointOutcome, SafepointPhase,
    SafepointReason, SafepointRequest, SafepointSettings, SafepointState, SafepointStats,
    SafepointTimeout, SyncStage,
};
use crate::collector::Collector;
use crate::critical::{CriticalRegionTracker, LockerWait};
use crate::error::{panic_message, VmError, VmResult};
use crate::fatal::{FatalError, FatalReporter};
use crate::policy::CollectorPolicy;
use crate::thread::{ThreadRecord, ThreadRegistry, ThreadState};
use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct Queue {
    phase: SafepointPhase,
    pending: VecDeque<Arc<RequestSlot>>,
    in_flight: Vec<Arc<RequestSlot>>,
    next_seq: u64,
    shutdown: bool,
}

enum SyncResult {
    Reached,
    Abandoned,
    TimedOut(SafepointTimeout),
}

pub(super) struct CoordinatorCore {
    settings: SafepointSettings,
    policy: CollectorPolicy,
    registry: Arc<ThreadRegistry>,
    tracker: Arc<CriticalRegionTracker>,
    state: Arc<SafepointState>,
    collector: Arc<dyn Collector>,
    fatal: FatalReporter,
    queue: Mutex<Queue>,
    work: Condvar,
    abandon: AtomicBool,
    stats: StatsRecorder,
    last_outcome: ArcSwapOption<SafepointOutcome>,
}

/// Serves safepoint requests on a dedicated "VM Thread".
///
/// # Examples
///
/// ```
/// use vmsync::collector::GcCause;
/// use vmsync::config::VmConfig;
/// use vmsync::safepoint::{SafepointPhase, SafepointReason};
/// use vmsync::vm::Vm;
///
/// let vm = Vm::new(VmConfig::default()).unwrap();
/// let coordinator = vm.safepoints();
/// let first = coordinator.request_safepoint(SafepointReason::Collect(GcCause::SystemGc));
/// let outcome = first.wait().unwrap();
/// assert!(outcome.collected);
/// assert_eq!(coordinator.phase(), SafepointPhase::Idle);
/// assert_eq!(coordinator.stats().safepoints, 1);
/// vm.shutdown();
/// ```
pub struct SafepointCoordinator {
    core: Arc<CoordinatorCore>,
    vm_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SafepointCoordinator {
    /// Start the VM thread.
    pub fn start(
        settings: SafepointSettings,
        registry: Arc<ThreadRegistry>,
        tracker: Arc<CriticalRegionTracker>,
        state: Arc<SafepointState>,
        collector: Arc<dyn Collector>,
        fatal: FatalReporter,
    ) -> VmResult<Self> {
        let core = Arc::new(CoordinatorCore {
            settings,
            policy: tracker.policy(),
            registry,
            tracker,
            state,
            collector,
            fatal,
            queue: Mutex::new(Queue {
                phase: SafepointPhase::Idle,
                pending: VecDeque::new(),
                in_flight: Vec::new(),
                next_seq: 1,
                shutdown: false,
            }),
            work: Condvar::new(),
            abandon: AtomicBool::new(false),
            stats: StatsRecorder::default(),
            last_outcome: ArcSwapOption::empty(),
        });

        let vm_core = Arc::clone(&core);
        let handle = thread::Builder::new()
            .name("VM Thread".to_string())
            .spawn(move || vm_core.run())
            .map_err(|err| VmError::Spawn(err.to_string()))?;

        tracing::debug!(policy = %core.policy, "safepoint coordinator started");
        Ok(Self {
            core,
            vm_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn request_safepoint(&self, reason: SafepointReason) -> SafepointRequest {
        self.core.enqueue(reason, None)
    }

    /// Queue `operation` to run on the VM thread once every thread is safe.
    pub fn request_operation<F>(&self, reason: SafepointReason, operation: F) -> SafepointRequest
    where
        F: FnOnce(&SafepointContext<'_>) + Send + 'static,
    {
        self.core.enqueue(reason, Some(Box::new(operation)))
    }

    pub fn phase(&self) -> SafepointPhase {
        self.core.queue.lock().phase
    }

    pub fn pending_requests(&self) -> usize {
        self.core.queue.lock().pending.len()
    }

    pub fn stats(&self) -> SafepointStats {
        self.core
            .stats
            .snapshot(self.core.state.polls(), self.core.state.hits())
    }

    /// Outcome of the most recent safepoint that reached `Active`.
    pub fn last_outcome(&self) -> Option<SafepointOutcome> {
        self.core.last_outcome.load_full().map(|outcome| (*outcome).clone())
    }

    pub fn policy(&self) -> CollectorPolicy {
        self.core.policy
    }

    pub fn is_shut_down(&self) -> bool {
        self.core.queue.lock().shutdown
    }

    /// Fail every queued request, let an in-flight synchronization give up
    /// and join the VM thread. Idempotent.
    pub fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut queue = self.core.queue.lock();
            queue.shutdown = true;
            if !queue.in_flight.is_empty() {
                self.core.abandon.store(true, Ordering::SeqCst);
            }
            self.core.work.notify_all();
            queue.pending.drain(..).collect()
        };
        for slot in drained {
            slot.complete(Err(VmError::ShutDown));
        }
        self.core.state.notify_progress();

        let handle = self.vm_thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("VM thread panicked");
            }
            tracing::debug!("safepoint coordinator stopped");
        }
    }
}

impl Drop for SafepointCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CoordinatorCore {
    fn enqueue(
        self: &Arc<Self>,
        reason: SafepointReason,
        operation: Option<SafepointOperation>,
    ) -> SafepointRequest {
        let slot = {
            let mut queue = self.queue.lock();
            let seq = queue.next_seq;
            queue.next_seq += 1;
            let slot = Arc::new(RequestSlot::new(seq, reason, operation));
            if queue.shutdown {
                slot.complete(Err(VmError::ShutDown));
            } else {
                queue.pending.push_back(Arc::clone(&slot));
                if queue.phase == SafepointPhase::Idle {
                    queue.phase = SafepointPhase::Requested;
                }
                self.work.notify_one();
            }
            slot
        };
        tracing::debug!(seq = slot.seq(), reason = %slot.reason(), "safepoint requested");
        SafepointRequest::new(slot, Arc::clone(self))
    }

    pub(super) fn cancel(&self, slot: &Arc<RequestSlot>) -> VmResult<()> {
        let mut queue = self.queue.lock();
        match slot.state() {
            RequestState::Queued => {
                queue.pending.retain(|queued| !Arc::ptr_eq(queued, slot));
                slot.cancel();
                if queue.pending.is_empty() && queue.phase == SafepointPhase::Requested {
                    queue.phase = SafepointPhase::Idle;
                }
            }
            RequestState::Synchronizing => {
                slot.cancel();
                if queue.in_flight.iter().all(|request| request.is_cancelled()) {
                    self.abandon.store(true, Ordering::SeqCst);
                    drop(queue);
                    self.state.notify_progress();
                }
            }
            RequestState::Cancelled => return Ok(()),
            RequestState::Active | RequestState::Completed => return Err(VmError::CancelTooLate),
        }
        self.stats.record_cancellation();
        tracing::debug!(seq = slot.seq(), "safepoint request cancelled");
        Ok(())
    }

    fn run(&self) {
        tracing::debug!("VM thread running");
        while let Some(batch) = self.next_batch() {
            self.execute(batch);
        }
        tracing::debug!("VM thread exiting");
    }

    fn next_batch(&self) -> Option<Vec<Arc<RequestSlot>>> {
        let mut queue = self.queue.lock();
        while queue.pending.is_empty() {
            if queue.shutdown {
                return None;
            }
            self.work.wait(&mut queue);
        }
        let batch: Vec<_> = queue.pending.drain(..).collect();
        for slot in &batch {
            slot.begin_sync();
        }
        queue.in_flight = batch.clone();
        queue.phase = SafepointPhase::WaitingForThreads;
        self.abandon.store(false, Ordering::SeqCst);
        Some(batch)
    }

    fn execute(&self, batch: Vec<Arc<RequestSlot>>) {
        let started = Instant::now();
        let id = self.state.arm();
        tracing::debug!(safepoint = id, requests = batch.len(), "synchronizing threads");

        match self.synchronize(id, started) {
            SyncResult::Reached => {
                let time_to_safepoint = started.elapsed();
                let live: Vec<_> = {
                    let mut queue = self.queue.lock();
                    let live: Vec<_> = batch.iter().filter(|slot| slot.activate()).cloned().collect();
                    if !live.is_empty() {
                        queue.phase = SafepointPhase::Active;
                    }
                    live
                };
                if live.is_empty() {
                    self.abandon_batch(id, &batch);
                    return;
                }
                self.run_active(id, &live, started, time_to_safepoint);
            }
            SyncResult::Abandoned => self.abandon_batch(id, &batch),
            SyncResult::TimedOut(timeout) => {
                self.stats.record_timeout();
                tracing::error!(safepoint = id, %timeout, "safepoint synchronization timed out");
                self.release();
                self.finish_batch();
                for slot in &batch {
                    slot.complete(Err(VmError::SafepointTimeout(timeout.clone())));
                }
                // Requesters are released first; a panicking reporter
                // unwinds the VM thread.
                if self.settings.escalate_timeouts {
                    self.fatal.report(FatalError::SafepointTimeout(timeout));
                }
            }
        }
    }

    fn synchronize(&self, id: u64, started: Instant) -> SyncResult {
        if self.policy.requires_global_exclusion() {
            self.tracker.close_gate();
            let wait = self.tracker.wait_until_released(
                self.settings.locker_timeout,
                self.settings.poll_tick,
                || self.abandon.load(Ordering::SeqCst),
            );
            match wait {
                LockerWait::Released => {}
                LockerWait::Abandoned => return SyncResult::Abandoned,
                LockerWait::TimedOut => {
                    let holders = self
                        .registry
                        .snapshot()
                        .into_iter()
                        .filter(|record| record.holds_permit() || record.critical_depth() > 0);
                    return SyncResult::TimedOut(self.diagnose(
                        id,
                        SyncStage::LockerRelease,
                        started,
                        holders,
                    ));
                }
            }
        }

        let deadline = Instant::now() + self.settings.sync_timeout;
        loop {
            let blockers: Vec<_> = self
                .registry
                .snapshot()
                .into_iter()
                .filter(|record| !self.is_safe(record))
                .collect();
            if blockers.is_empty() {
                return SyncResult::Reached;
            }
            if self.abandon.load(Ordering::SeqCst) {
                return SyncResult::Abandoned;
            }
            if Instant::now() >= deadline {
                return SyncResult::TimedOut(self.diagnose(
                    id,
                    SyncStage::ThreadSync,
                    started,
                    blockers,
                ));
            }
            self.state.wait_for_progress(self.settings.poll_tick);
        }
    }

    fn is_safe(&self, record: &ThreadRecord) -> bool {
        let state = record.state();
        state.is_safe()
            || (state == ThreadState::InJniCritical && self.policy.critical_thread_is_safe())
    }

    fn diagnose(
        &self,
        id: u64,
        stage: SyncStage,
        started: Instant,
        blockers: impl IntoIterator<Item = Arc<ThreadRecord>>,
    ) -> SafepointTimeout {
        SafepointTimeout {
            safepoint_id: id,
            stage,
            waited: started.elapsed(),
            blocking: blockers
                .into_iter()
                .map(|record| BlockingThread::of(&record))
                .collect(),
        }
    }

    fn run_active(
        &self,
        id: u64,
        live: &[Arc<RequestSlot>],
        started: Instant,
        time_to_safepoint: Duration,
    ) {
        let threads = self.registry.snapshot();
        let reasons: Vec<_> = live.iter().map(|slot| slot.reason().clone()).collect();
        let cx = SafepointContext::new(id, self.policy, &reasons, &threads);
        tracing::debug!(safepoint = id, threads = threads.len(), ?time_to_safepoint, "safepoint active");

        let mut collected = false;
        if cx.needs_collection() {
            match panic::catch_unwind(AssertUnwindSafe(|| self.collector.collect(&cx))) {
                Ok(()) => collected = true,
                Err(payload) => tracing::error!(
                    safepoint = id,
                    collector = self.collector.name(),
                    message = %panic_message(payload.as_ref()),
                    "collector panicked during safepoint"
                ),
            }
        }

        let results: Vec<VmResult<()>> = live
            .iter()
            .map(|slot| match slot.take_operation() {
                Some(operation) => panic::catch_unwind(AssertUnwindSafe(|| operation(&cx)))
                    .map_err(|payload| {
                        let message = panic_message(payload.as_ref());
                        tracing::error!(safepoint = id, seq = slot.seq(), %message, "safepoint operation panicked");
                        VmError::OperationPanicked(message)
                    }),
                None => Ok(()),
            })
            .collect();
        drop(cx);

        self.release();
        let outcome = SafepointOutcome {
            safepoint_id: id,
            batch_size: live.len(),
            time_to_safepoint,
            duration: started.elapsed(),
            collected,
        };
        self.stats.record_safepoint(live.len(), time_to_safepoint);
        self.last_outcome.store(Some(Arc::new(outcome.clone())));
        self.finish_batch();
        tracing::debug!(safepoint = id, duration = ?outcome.duration, "safepoint released");

        for (slot, result) in live.iter().zip(results) {
            slot.complete(result.map(|()| outcome.clone()));
        }
    }

    fn abandon_batch(&self, id: u64, batch: &[Arc<RequestSlot>]) {
        self.release();
        self.stats.record_abandoned();
        self.finish_batch();
        tracing::debug!(safepoint = id, "safepoint synchronization abandoned");
        for slot in batch {
            slot.complete(Err(VmError::ShutDown));
        }
    }

    fn release(&self) {
        self.state.disarm();
        self.tracker.open_gate();
    }

    fn finish_batch(&self) {
        let mut queue = self.queue.lock();
        queue.in_flight.clear();
        queue.phase = if queue.pending.is_empty() {
            SafepointPhase::Idle
        } else {
            SafepointPhase::Requested
        };
    }
}
