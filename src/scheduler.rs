//! Virtual threads multiplexed onto a fixed pool of carrier threads.
//!
//! A virtual thread is an explicit task on a run queue. Each call to
//! [`VirtualTask::run`] is one slice executed while the virtual thread is
//! mounted on a carrier; returning [`Step::Yield`] unmounts it and puts it
//! back on the queue. Because unmounting only happens between slices, a
//! virtual thread can never be unmounted in the middle of a critical region.

use crate::error::{panic_message, VmError, VmResult};
use crate::fatal::ImbalanceKind;
use crate::java_thread::{blocking, JavaThread};
use crate::services::VmServices;
use crate::thread::{ThreadDescriptor, ThreadRecord, ThreadState, VmThreadId};
use flume::{Receiver, RecvTimeoutError, Sender};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const IDLE_TICK: Duration = Duration::from_millis(20);

/// What a slice asks the scheduler to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Yield,
    Complete,
}

/// Body of a virtual thread.
pub trait VirtualTask: Send + 'static {
    fn run(&mut self, thread: &JavaThread) -> Step;
}

impl<F> VirtualTask for F
where
    F: FnMut(&JavaThread) -> Step + Send + 'static,
{
    fn run(&mut self, thread: &JavaThread) -> Step {
        self(thread)
    }
}

struct Job {
    record: Arc<ThreadRecord>,
    task: Box<dyn VirtualTask>,
    done: Sender<VmResult<()>>,
}

struct Shared {
    services: Arc<VmServices>,
    queue_tx: Sender<Job>,
    queue_rx: Receiver<Job>,
    // Held shared while a spawn checks the flag and queues its job, and
    // exclusively while shutdown raises the flag.
    spawn_gate: RwLock<()>,
    shutting_down: AtomicBool,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    carriers: Mutex<Vec<JoinHandle<()>>>,
    carrier_ids: Vec<VmThreadId>,
}

impl Scheduler {
    /// Start `carriers` carrier threads, each attached as a daemon.
    pub fn start(services: Arc<VmServices>, carriers: usize) -> VmResult<Self> {
        let (queue_tx, queue_rx) = flume::unbounded();
        let shared = Arc::new(Shared {
            services,
            queue_tx,
            queue_rx,
            spawn_gate: RwLock::new(()),
            shutting_down: AtomicBool::new(false),
        });

        let (ready_tx, ready_rx) = flume::bounded(carriers.max(1));
        let mut handles = Vec::with_capacity(carriers);
        for index in 0..carriers {
            let shared = Arc::clone(&shared);
            let ready_tx = ready_tx.clone();
            let name = format!("Carrier-{index}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || carrier_main(shared, name, ready_tx))
                .map_err(|err| VmError::Spawn(err.to_string()))?;
            handles.push(handle);
        }
        drop(ready_tx);

        let mut carrier_ids = Vec::with_capacity(carriers);
        let mut failure = None;
        for _ in 0..carriers {
            match ready_rx.recv() {
                Ok(Ok(id)) => carrier_ids.push(id),
                Ok(Err(err)) => failure = Some(err),
                Err(_) => {
                    failure = Some(VmError::Spawn("carrier thread exited during startup".into()));
                    break;
                }
            }
        }
        carrier_ids.sort_unstable();

        let scheduler = Self {
            shared,
            carriers: Mutex::new(handles),
            carrier_ids,
        };
        if let Some(err) = failure {
            scheduler.shutdown();
            return Err(err);
        }
        tracing::debug!(carriers, "virtual thread scheduler started");
        Ok(scheduler)
    }

    /// Register a virtual thread and queue it. The record is visible in the
    /// registry in state `New` before this returns.
    pub fn spawn_virtual<T: VirtualTask>(&self, name: impl Into<String>, task: T) -> VmResult<VirtualThread> {
        let _gate = self.shared.spawn_gate.read();
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(VmError::ShutDown);
        }
        if self.carrier_ids.is_empty() {
            return Err(VmError::Spawn("virtual thread scheduler has no carrier threads".into()));
        }
        let record = self
            .shared
            .services
            .registry()
            .register(ThreadDescriptor::virtual_thread(name))?;
        let (done, result) = flume::bounded(1);
        let handle = VirtualThread {
            id: record.id(),
            name: record.name().to_string(),
            result_rx: result,
            result: OnceCell::new(),
        };
        let job = Job {
            record,
            task: Box::new(task),
            done,
        };
        if let Err(flume::SendError(job)) = self.shared.queue_tx.send(job) {
            self.shared.cancel(job);
        }
        tracing::debug!(thread = %handle.id, name = %handle.name, "virtual thread spawned");
        Ok(handle)
    }

    pub fn carrier_ids(&self) -> &[VmThreadId] {
        &self.carrier_ids
    }

    /// Jobs waiting for a carrier.
    pub fn queued(&self) -> usize {
        self.shared.queue_rx.len()
    }

    /// Stop the carriers after their current slice, then fail every virtual
    /// thread still queued. Once this returns no spawn can reach the queue.
    /// Idempotent.
    pub fn shutdown(&self) {
        {
            let _gate = self.shared.spawn_gate.write();
            self.shared.shutting_down.store(true, Ordering::SeqCst);
        }
        let handles: Vec<_> = self.carriers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("carrier thread panicked");
            }
        }
        for job in self.shared.queue_rx.try_iter() {
            self.shared.cancel(job);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("carriers", &self.carrier_ids)
            .field("queued", &self.queued())
            .finish()
    }
}

fn carrier_main(shared: Arc<Shared>, name: String, ready: Sender<VmResult<VmThreadId>>) {
    let descriptor = ThreadDescriptor::platform(name).daemon();
    let carrier = match JavaThread::attach(&shared.services, descriptor) {
        Ok(carrier) => carrier,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    let _ = ready.send(Ok(carrier.id()));
    drop(ready);

    while !shared.shutting_down.load(Ordering::SeqCst) {
        let next = carrier.call_native(|| shared.queue_rx.recv_timeout(IDLE_TICK));
        match next {
            Ok(job) => {
                if let Some(job) = shared.run_slice(&carrier, job) {
                    shared.requeue(job);
                }
            }
            Err(RecvTimeoutError::Timeout) => carrier.pollcheck(),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Err(err) = carrier.detach() {
        tracing::warn!(%err, "carrier detach failed");
    }
}

impl Shared {
    /// Mount `job` on `carrier`, run one slice and unmount it. Returns the
    /// job when it yielded.
    fn run_slice(&self, carrier: &JavaThread, mut job: Job) -> Option<Job> {
        let record = Arc::clone(&job.record);
        carrier.record().transition(ThreadState::Parked, "mount");
        record.bind_owner(Some(thread::current().id()));
        record.set_carrier(Some(carrier.id()));
        record.transition(ThreadState::RunningJava, "mount");

        let outcome = {
            let vthread = JavaThread::mounted(&self.services, Arc::clone(&record));
            tracing::trace!(thread = %record.id(), carrier = %carrier.id(), "mounted");
            panic::catch_unwind(AssertUnwindSafe(|| {
                vthread.pollcheck();
                job.task.run(&vthread)
            }))
        };

        let result = match outcome {
            Ok(Step::Yield) => {
                if record.critical_depth() > 0 {
                    record.imbalance(ImbalanceKind::Unmounting, "unmount");
                }
                record.transition(ThreadState::Parked, "unmount");
                record.set_carrier(None);
                record.bind_owner(None);
                None
            }
            Ok(Step::Complete) => {
                if record.critical_depth() > 0 {
                    record.imbalance(ImbalanceKind::Terminating, "terminate");
                }
                record.transition(ThreadState::Terminated, "terminate");
                Some(Ok(()))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(thread = %record.id(), %message, "virtual thread panicked");
                self.services.critical().release_leaked(&record);
                record.force_state(ThreadState::Terminated);
                Some(Err(VmError::VirtualThreadPanicked {
                    thread: record.id(),
                    message,
                }))
            }
        };

        carrier.record().transition(ThreadState::RunningJava, "unmount");
        carrier.pollcheck();

        match result {
            None => Some(job),
            Some(result) => {
                self.finish(&job, result);
                None
            }
        }
    }

    fn requeue(&self, job: Job) {
        if self.shutting_down.load(Ordering::SeqCst) {
            self.cancel(job);
        } else if let Err(flume::SendError(job)) = self.queue_tx.send(job) {
            self.cancel(job);
        }
    }

    /// Tear down a virtual thread that never gets to run again.
    fn cancel(&self, job: Job) {
        let record = &job.record;
        record.bind_owner(Some(thread::current().id()));
        record.transition(ThreadState::Terminated, "cancel");
        self.finish(&job, Err(VmError::ShutDown));
    }

    fn finish(&self, job: &Job, result: VmResult<()>) {
        let record = &job.record;
        record.set_carrier(None);
        record.bind_owner(None);
        if let Err(err) = self.services.registry().unregister(record.id()) {
            tracing::warn!(thread = %record.id(), %err, "virtual thread already unregistered");
        }
        tracing::debug!(thread = %record.id(), ok = result.is_ok(), "virtual thread finished");
        let _ = job.done.send(result);
    }
}

/// Handle to a spawned virtual thread.
pub struct VirtualThread {
    id: VmThreadId,
    name: String,
    result_rx: Receiver<VmResult<()>>,
    result: OnceCell<VmResult<()>>,
}

impl VirtualThread {
    pub fn id(&self) -> VmThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.poll_result(Some(Duration::ZERO)).is_some()
    }

    /// Wait for the task to complete. An attached caller waits in native
    /// state.
    pub fn join(self) -> VmResult<()> {
        match blocking(|| self.poll_result(None)) {
            Some(result) => result,
            None => Err(VmError::ShutDown),
        }
    }

    /// `None` when the task is still running after `timeout`.
    pub fn join_timeout(&self, timeout: Duration) -> Option<VmResult<()>> {
        blocking(|| self.poll_result(Some(timeout)))
    }

    fn poll_result(&self, timeout: Option<Duration>) -> Option<VmResult<()>> {
        if let Some(result) = self.result.get() {
            return Some(result.clone());
        }
        let received = match timeout {
            Some(timeout) => match self.result_rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => Err(VmError::ShutDown),
            },
            None => self.result_rx.recv().unwrap_or(Err(VmError::ShutDown)),
        };
        Some(self.result.get_or_init(|| received).clone())
    }
}

impl fmt::Debug for VirtualThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("finished", &self.result.get().is_some())
            .finish()
    }
}
