//! The handle an attached thread uses to drive itself.
//!
//! A [`JavaThread`] is created by attaching the calling OS thread to a VM
//! (or by the scheduler when it mounts a virtual thread) and is the only way
//! to change the thread's state: entering and leaving native code, opening
//! critical regions, polling for safepoints. It is deliberately `!Send`.
//!
//! The current thread is also published in a thread-local so that code
//! without access to the handle can still [`pollcheck`].

use crate::collector::GcCause;
use crate::critical::RegionId;
use crate::error::{VmError, VmResult};
use crate::fatal::ImbalanceKind;
use crate::safepoint::{SafepointContext, SafepointOutcome, SafepointReason};
use crate::services::VmServices;
use crate::signal::SignalSet;
use crate::thread::{ThreadDescriptor, ThreadKind, ThreadRecord, ThreadState, VmThreadId};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct Current {
    record: Arc<ThreadRecord>,
    services: Arc<VmServices>,
}

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
}

fn swap_current(next: Option<Current>) -> Option<Current> {
    CURRENT.with(|current| std::mem::replace(&mut *current.borrow_mut(), next))
}

fn with_current<R>(f: impl FnOnce(Option<&Current>) -> R) -> R {
    CURRENT.with(|current| f(current.borrow().as_ref()))
}

/// Id of the VM thread running on this OS thread, if any.
pub fn current_thread_id() -> Option<VmThreadId> {
    with_current(|current| current.map(|c| c.record.id()))
}

/// Safepoint poll for whatever VM thread runs on this OS thread.
///
/// Does nothing on threads that are not attached.
#[inline]
pub fn pollcheck() {
    with_current(|current| {
        if let Some(current) = current {
            current.services.safepoint_state().poll(&current.record);
        }
    })
}

/// Run `f` with the current thread in native state, if it is attached and
/// running managed code. Used by blocking VM entry points.
pub(crate) fn blocking<R>(f: impl FnOnce() -> R) -> R {
    let current = with_current(|current| current.cloned());
    match current {
        Some(current) if current.record.state() == ThreadState::RunningJava => {
            enter_native(&current.services, &current.record);
            let _scope = NativeScope {
                services: &current.services,
                record: &current.record,
            };
            f()
        }
        _ => f(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Attached,
    Mounted,
}

/// Owner handle of one VM thread.
pub struct JavaThread {
    record: Arc<ThreadRecord>,
    services: Arc<VmServices>,
    mode: Mode,
    saved_os_mask: Option<SignalSet>,
    detached: Cell<bool>,
    previous: RefCell<Option<Current>>,
    _not_send: PhantomData<*const ()>,
}

impl JavaThread {
    /// Attach the calling OS thread. Virtual descriptors are attached as
    /// platform threads.
    pub(crate) fn attach(
        services: &Arc<VmServices>,
        mut descriptor: ThreadDescriptor,
    ) -> VmResult<JavaThread> {
        if let Some(existing) = current_thread_id() {
            return Err(VmError::DuplicateRegistration(existing));
        }
        descriptor.kind = ThreadKind::Platform;
        let record = services.registry().register(descriptor)?;
        let saved_os_mask = services.signals().capture_os_mask();
        let mask = record.signal_mask();
        if !mask.is_empty() {
            services.signals().install_on(&record, mask);
        }
        record.transition(ThreadState::RunningJava, "attach");
        swap_current(Some(Current {
            record: Arc::clone(&record),
            services: Arc::clone(services),
        }));
        tracing::debug!(thread = %record.id(), name = record.name(), "thread attached");

        Ok(JavaThread {
            record,
            services: Arc::clone(services),
            mode: Mode::Attached,
            saved_os_mask,
            detached: Cell::new(false),
            previous: RefCell::new(None),
            _not_send: PhantomData,
        })
    }

    /// Handle for a virtual thread the caller has just mounted on its OS
    /// thread. Dropping it restores the carrier as the current thread.
    pub(crate) fn mounted(services: &Arc<VmServices>, record: Arc<ThreadRecord>) -> JavaThread {
        let previous = swap_current(Some(Current {
            record: Arc::clone(&record),
            services: Arc::clone(services),
        }));
        JavaThread {
            record,
            services: Arc::clone(services),
            mode: Mode::Mounted,
            saved_os_mask: None,
            detached: Cell::new(false),
            previous: RefCell::new(previous),
            _not_send: PhantomData,
        }
    }

    pub fn id(&self) -> VmThreadId {
        self.record.id()
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    pub fn kind(&self) -> ThreadKind {
        self.record.kind()
    }

    pub fn state(&self) -> ThreadState {
        self.record.state()
    }

    pub fn critical_depth(&self) -> u32 {
        self.record.critical_depth()
    }

    pub fn record(&self) -> &Arc<ThreadRecord> {
        &self.record
    }

    #[inline]
    pub fn pollcheck(&self) {
        self.services.safepoint_state().poll(&self.record);
    }

    // ---- native boundary ----------------------------------------------------

    pub fn enter_native(&self) {
        enter_native(&self.services, &self.record);
    }

    pub fn exit_native(&self) {
        exit_native(&self.services, &self.record);
    }

    /// Run `f` as native code. The thread counts as safe for the duration
    /// and polls on return.
    pub fn call_native<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter_native();
        let _scope = NativeScope {
            services: &self.services,
            record: &self.record,
        };
        f()
    }

    // ---- critical regions ---------------------------------------------------

    /// Returns the new depth.
    pub fn begin_critical(&self) -> u32 {
        self.services.critical().enter(&self.record, None)
    }

    pub fn begin_critical_region(&self, region: RegionId) -> u32 {
        self.services.critical().enter(&self.record, Some(region))
    }

    /// Returns the new depth.
    pub fn end_critical(&self) -> u32 {
        self.services.critical().exit(&self.record)
    }

    /// Run `f` inside a critical region.
    pub fn critical<R>(&self, f: impl FnOnce() -> R) -> R {
        let _section = crate::jni::CriticalSection::enter(self);
        f()
    }

    pub fn critical_region<R>(&self, region: RegionId, f: impl FnOnce() -> R) -> R {
        let _section = crate::jni::CriticalSection::enter_region(self, region);
        f()
    }

    // ---- safepoints ---------------------------------------------------------

    /// Request a safepoint and wait for it in native state.
    pub fn request_safepoint(&self, reason: SafepointReason) -> VmResult<SafepointOutcome> {
        let request = self.services.safepoints().request_safepoint(reason);
        self.wait_native(|| request.wait())
    }

    pub fn request_operation<F>(&self, reason: SafepointReason, operation: F) -> VmResult<SafepointOutcome>
    where
        F: FnOnce(&SafepointContext<'_>) + Send + 'static,
    {
        let request = self.services.safepoints().request_operation(reason, operation);
        self.wait_native(|| request.wait())
    }

    pub fn collect(&self, cause: GcCause) -> VmResult<SafepointOutcome> {
        self.request_safepoint(SafepointReason::Collect(cause))
    }

    fn wait_native<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.state() == ThreadState::RunningJava {
            self.call_native(f)
        } else {
            f()
        }
    }

    // ---- signals and interrupts ---------------------------------------------

    pub fn signal_mask(&self) -> SignalSet {
        self.record.signal_mask()
    }

    /// Install a new blocked set, returning the previous one.
    pub fn install_signal_mask(&self, mask: SignalSet) -> SignalSet {
        self.services.signals().install_on(&self.record, mask)
    }

    /// Remove and return every signal this thread can take now.
    pub fn take_signals(&self) -> SignalSet {
        self.services.signals().take_signals(&self.record)
    }

    pub fn is_interrupted(&self) -> bool {
        self.record.is_interrupted()
    }

    /// Test and clear the interrupt flag.
    pub fn interrupted(&self) -> bool {
        self.services.signals().interrupted(&self.record)
    }

    /// Sleep in native state. Returns `true` when cut short by an interrupt,
    /// clearing the flag.
    pub fn sleep(&self, duration: Duration) -> bool {
        let signals = Arc::clone(self.services.signals());
        self.wait_native(|| signals.sleep(&self.record, duration))
    }

    // ---- lifecycle ----------------------------------------------------------

    /// Detach the calling OS thread. Detaching inside a critical region is
    /// fatal.
    pub fn detach(self) -> VmResult<()> {
        self.detach_inner()
    }

    fn detach_inner(&self) -> VmResult<()> {
        if self.mode != Mode::Attached || self.detached.replace(true) {
            return Ok(());
        }
        if self.record.critical_depth() > 0 {
            self.record.imbalance(ImbalanceKind::Terminating, "detach");
        }
        self.record.transition(ThreadState::Terminated, "detach");
        swap_current(None);
        self.services.signals().restore_os_mask(&self.record, self.saved_os_mask);
        self.services.registry().unregister(self.record.id())?;
        tracing::debug!(thread = %self.record.id(), "thread detached");
        Ok(())
    }

    /// Tear down without the imbalance checks. Used while unwinding.
    fn abandon(&self) {
        if self.mode != Mode::Attached || self.detached.replace(true) {
            return;
        }
        let leaked = self.services.critical().release_leaked(&self.record);
        if leaked > 0 {
            tracing::warn!(thread = %self.record.id(), leaked, "released critical regions of a panicking thread");
        }
        self.record.force_state(ThreadState::Terminated);
        swap_current(None);
        self.services.signals().restore_os_mask(&self.record, self.saved_os_mask);
        let _ = self.services.registry().unregister(self.record.id());
    }
}

impl Drop for JavaThread {
    fn drop(&mut self) {
        match self.mode {
            Mode::Attached if std::thread::panicking() => self.abandon(),
            Mode::Attached => {
                if let Err(err) = self.detach_inner() {
                    tracing::warn!(thread = %self.record.id(), %err, "detach on drop failed");
                }
            }
            Mode::Mounted => {
                swap_current(self.previous.borrow_mut().take());
            }
        }
    }
}

impl fmt::Debug for JavaThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JavaThread")
            .field("record", &self.record)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Leaves native state when dropped, including during unwinding.
struct NativeScope<'a> {
    services: &'a Arc<VmServices>,
    record: &'a ThreadRecord,
}

impl Drop for NativeScope<'_> {
    fn drop(&mut self) {
        exit_native(self.services, self.record);
    }
}

fn enter_native(services: &VmServices, record: &ThreadRecord) {
    match record.state() {
        ThreadState::InJniCritical => {
            record.imbalance(ImbalanceKind::ReenteringNative, "enter_native")
        }
        _ => {
            record.transition(ThreadState::InNative, "enter_native");
        }
    }
    if services.safepoint_state().is_requested() {
        services.safepoint_state().notify_progress();
    }
}

fn exit_native(services: &VmServices, record: &ThreadRecord) {
    if record.state() == ThreadState::InJniCritical {
        if !services.policy().tolerates_critical_leak() {
            record.imbalance(ImbalanceKind::LeavingNative, "exit_native");
        }
        let leaked = services.critical().release_leaked(record);
        tracing::warn!(
            thread = %record.id(),
            leaked,
            policy = %services.policy(),
            "Leaving native code while in JNI critical section; releasing leaked regions"
        );
    }
    record.transition(ThreadState::RunningJava, "exit_native");
    services.safepoint_state().poll(record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::fatal::FatalAction;
    use crate::policy::CollectorPolicy;
    use crate::vm::Vm;

    fn vm(policy: CollectorPolicy) -> Arc<Vm> {
        Vm::new(
            VmConfig::default()
                .with_policy(policy)
                .with_carrier_threads(0)
                .with_fatal_action(FatalAction::Panic),
        )
        .unwrap()
    }

    #[test]
    fn attach_sets_current_thread() {
        let vm = vm(CollectorPolicy::NonMoving);
        std::thread::spawn(move || {
            assert_eq!(current_thread_id(), None);
            let thread = vm.attach_current_thread(ThreadDescriptor::platform("t")).unwrap();
            assert_eq!(current_thread_id(), Some(thread.id()));
            assert_eq!(thread.state(), ThreadState::RunningJava);

            let err = vm
                .attach_current_thread(ThreadDescriptor::platform("again"))
                .unwrap_err();
            assert_eq!(err, VmError::DuplicateRegistration(thread.id()));

            let id = thread.id();
            thread.detach().unwrap();
            assert_eq!(current_thread_id(), None);
            assert!(!vm.registry().contains(id));
            vm.shutdown();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn call_native_round_trips_state() {
        let vm = vm(CollectorPolicy::CountedLocker);
        std::thread::spawn(move || {
            let thread = vm.attach_current_thread(ThreadDescriptor::platform("t")).unwrap();
            let seen = thread.call_native(|| thread.state());
            assert_eq!(seen, ThreadState::InNative);
            assert_eq!(thread.state(), ThreadState::RunningJava);
            drop(thread);
            vm.shutdown();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn leaked_regions_are_released_under_pinning() {
        let vm = vm(CollectorPolicy::RegionPinning);
        std::thread::spawn(move || {
            let thread = vm.attach_current_thread(ThreadDescriptor::platform("t")).unwrap();
            thread.enter_native();
            thread.begin_critical_region(RegionId(5));
            assert!(vm.critical().is_pinned(RegionId(5)));

            thread.exit_native();
            assert_eq!(thread.state(), ThreadState::RunningJava);
            assert_eq!(thread.critical_depth(), 0);
            assert!(!vm.critical().is_pinned(RegionId(5)));
            drop(thread);
            vm.shutdown();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn reentering_native_from_critical_is_fatal() {
        let vm = vm(CollectorPolicy::NonMoving);
        let handle = {
            let vm = Arc::clone(&vm);
            std::thread::spawn(move || {
                let thread = vm.attach_current_thread(ThreadDescriptor::platform("t")).unwrap();
                thread.begin_critical();
                thread.enter_native();
            })
        };
        let payload = handle.join().unwrap_err();
        let message = crate::error::panic_message(payload.as_ref());
        assert!(message.contains("Entering native code while in JNI critical section"));
        vm.shutdown();
    }

    #[test]
    fn pollcheck_is_noop_when_detached() {
        pollcheck();
        assert_eq!(current_thread_id(), None);
    }
}
