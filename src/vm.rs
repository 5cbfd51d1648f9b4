//! The VM instance: owner of every coordination component.
//!
//! Tests build isolated instances with [`Vm::new`]. Embedders that want a
//! single process-wide VM install it explicitly with [`Vm::initialize`] and
//! remove it with [`Vm::teardown`]; nothing is created implicitly.
//!
//! # Examples
//!
//! ```
//! use vmsync::config::VmConfig;
//! use vmsync::thread::{ThreadDescriptor, ThreadState};
//! use vmsync::vm::Vm;
//!
//! let vm = Vm::new(VmConfig::default().with_carrier_threads(0)).unwrap();
//! let worker = std::sync::Arc::clone(&vm);
//! std::thread::spawn(move || {
//!     let thread = worker.attach_current_thread(ThreadDescriptor::platform("worker")).unwrap();
//!     assert_eq!(thread.state(), ThreadState::RunningJava);
//!     let depth = thread.critical(|| thread.critical_depth());
//!     assert_eq!(depth, 1);
//!     thread.detach().unwrap();
//! })
//! .join()
//! .unwrap();
//! assert!(vm.registry().is_empty());
//! vm.shutdown();
//! ```

use crate::collector::{Collector, GcCause, NoopCollector};
use crate::config::VmConfig;
use crate::critical::CriticalRegionTracker;
use crate::error::{VmError, VmResult};
use crate::java_thread::{blocking, JavaThread};
use crate::management::ThreadManagement;
use crate::policy::CollectorPolicy;
use crate::safepoint::{SafepointCoordinator, SafepointOutcome, SafepointReason, SafepointState};
use crate::scheduler::{Scheduler, VirtualTask, VirtualThread};
use crate::services::VmServices;
use crate::signal::SignalDispatcher;
use crate::suspend::SuspendController;
use crate::thread::{ThreadDescriptor, ThreadRegistry};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

static GLOBAL: Lazy<RwLock<Option<Arc<Vm>>>> = Lazy::new(|| RwLock::new(None));

pub struct Vm {
    services: Arc<VmServices>,
    scheduler: Scheduler,
    management: ThreadManagement,
    shut_down: AtomicBool,
}

impl Vm {
    /// Build an isolated VM with a [`NoopCollector`] for the configured
    /// policy.
    pub fn new(config: VmConfig) -> VmResult<Arc<Vm>> {
        let collector = Arc::new(NoopCollector::new(config.policy));
        Self::with_collector(config, collector)
    }

    /// Build an isolated VM around `collector`. The collector's policy
    /// overrides `config.policy`.
    pub fn with_collector(config: VmConfig, collector: Arc<dyn Collector>) -> VmResult<Arc<Vm>> {
        let carriers = config.carrier_threads;
        let services = Arc::new(VmServices::new(config, collector)?);
        let scheduler = match Scheduler::start(Arc::clone(&services), carriers) {
            Ok(scheduler) => scheduler,
            Err(err) => {
                services.safepoints().shutdown();
                return Err(err);
            }
        };
        let management = ThreadManagement::new(Arc::clone(services.registry()));
        tracing::info!(policy = %services.policy(), carriers, "vm started");
        Ok(Arc::new(Vm {
            services,
            scheduler,
            management,
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Install the process-wide VM.
    pub fn initialize(config: VmConfig) -> VmResult<Arc<Vm>> {
        let mut global = GLOBAL.write();
        if global.is_some() {
            return Err(VmError::AlreadyInitialized);
        }
        let vm = Vm::new(config)?;
        *global = Some(Arc::clone(&vm));
        Ok(vm)
    }

    pub fn global() -> VmResult<Arc<Vm>> {
        GLOBAL.read().clone().ok_or(VmError::NotInitialized)
    }

    /// Shut down and uninstall the process-wide VM.
    pub fn teardown() -> VmResult<()> {
        let vm = GLOBAL.write().take().ok_or(VmError::NotInitialized)?;
        vm.shutdown();
        Ok(())
    }

    /// Attach the calling OS thread. Fails with `DuplicateRegistration` if
    /// it is already attached to any VM.
    pub fn attach_current_thread(&self, descriptor: ThreadDescriptor) -> VmResult<JavaThread> {
        if self.is_shut_down() {
            return Err(VmError::ShutDown);
        }
        JavaThread::attach(&self.services, descriptor)
    }

    /// Run `f` on a new daemon platform thread attached with the helper
    /// signal mask. The spawning thread's own mask is left alone.
    pub fn spawn_helper<F, T>(&self, name: impl Into<String>, f: F) -> VmResult<JoinHandle<VmResult<T>>>
    where
        F: FnOnce(&JavaThread) -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shut_down() {
            return Err(VmError::ShutDown);
        }
        let name = name.into();
        let descriptor = ThreadDescriptor::platform(name.clone())
            .daemon()
            .with_signal_mask(self.services.config().helper_signal_mask);
        let services = Arc::clone(&self.services);
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                let thread = JavaThread::attach(&services, descriptor)?;
                let result = f(&thread);
                thread.detach()?;
                Ok(result)
            })
            .map_err(|err| VmError::Spawn(err.to_string()))
    }

    pub fn spawn_virtual<T: VirtualTask>(&self, name: impl Into<String>, task: T) -> VmResult<VirtualThread> {
        self.scheduler.spawn_virtual(name, task)
    }

    /// Run a collection at a safepoint and wait for it. An attached caller
    /// waits in native state.
    pub fn collect(&self, cause: GcCause) -> VmResult<SafepointOutcome> {
        let request = self
            .services
            .safepoints()
            .request_safepoint(SafepointReason::Collect(cause));
        blocking(|| request.wait())
    }

    pub fn config(&self) -> &VmConfig {
        self.services.config()
    }

    pub fn policy(&self) -> CollectorPolicy {
        self.services.policy()
    }

    pub fn services(&self) -> &Arc<VmServices> {
        &self.services
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        self.services.registry()
    }

    pub fn safepoints(&self) -> &SafepointCoordinator {
        self.services.safepoints()
    }

    pub fn safepoint_state(&self) -> &Arc<SafepointState> {
        self.services.safepoint_state()
    }

    pub fn critical(&self) -> &Arc<CriticalRegionTracker> {
        self.services.critical()
    }

    pub fn signals(&self) -> &Arc<SignalDispatcher> {
        self.services.signals()
    }

    pub fn suspension(&self) -> &Arc<SuspendController> {
        self.services.suspension()
    }

    pub fn management(&self) -> &ThreadManagement {
        &self.management
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop the carriers, then the VM thread. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.shutdown();
        self.services.safepoints().shutdown();
        tracing::info!(threads = self.registry().len(), "vm shut down");
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("services", &self.services)
            .field("scheduler", &self.scheduler)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fatal::FatalAction;
    use crate::thread::ThreadState;

    fn config() -> VmConfig {
        VmConfig::default()
            .with_carrier_threads(0)
            .with_fatal_action(FatalAction::Panic)
    }

    #[test]
    fn global_instance_lifecycle() {
        assert_eq!(Vm::teardown(), Err(VmError::NotInitialized));
        let vm = Vm::initialize(config()).unwrap();
        assert!(matches!(Vm::initialize(config()), Err(VmError::AlreadyInitialized)));
        assert!(Arc::ptr_eq(&Vm::global().unwrap(), &vm));

        Vm::teardown().unwrap();
        assert!(vm.is_shut_down());
        assert!(matches!(Vm::global(), Err(VmError::NotInitialized)));
    }

    #[test]
    fn helper_threads_are_daemons_and_detach() {
        let vm = Vm::new(config()).unwrap();
        let handle = vm
            .spawn_helper("Signal Dispatcher", |thread| {
                assert_eq!(thread.state(), ThreadState::RunningJava);
                (thread.id(), thread.record().is_daemon(), thread.signal_mask())
            })
            .unwrap();
        let (id, daemon, mask) = handle.join().unwrap().unwrap();

        assert!(daemon);
        assert_eq!(mask, vm.config().helper_signal_mask);
        assert!(!vm.registry().contains(id));
        vm.shutdown();
    }

    #[test]
    fn collect_from_unattached_thread() {
        let vm = Vm::new(config()).unwrap();
        let outcome = vm.collect(GcCause::SystemGc).unwrap();
        assert!(outcome.collected);
        assert_eq!(vm.safepoints().stats().safepoints, 1);
        vm.shutdown();
    }

    #[test]
    fn attach_after_shutdown_fails() {
        let vm = Vm::new(config()).unwrap();
        vm.shutdown();
        vm.shutdown();
        assert!(matches!(
            vm.attach_current_thread(ThreadDescriptor::platform("late")),
            Err(VmError::ShutDown)
        ));
    }
}
