//! Component container shared by a VM and its threads.
//!
//! Every VM owns one `VmServices`. Attached threads, carriers and the
//! management API hold it through an `Arc`; components never reach for
//! process-wide state, so isolated instances can coexist in one process.

use crate::collector::Collector;
use crate::config::VmConfig;
use crate::critical::CriticalRegionTracker;
use crate::error::VmResult;
use crate::fatal::FatalReporter;
use crate::policy::CollectorPolicy;
use crate::safepoint::{SafepointCoordinator, SafepointState};
use crate::signal::SignalDispatcher;
use crate::suspend::SuspendController;
use crate::thread::ThreadRegistry;
use std::fmt;
use std::sync::Arc;

pub struct VmServices {
    config: VmConfig,
    policy: CollectorPolicy,
    fatal: FatalReporter,
    registry: Arc<ThreadRegistry>,
    safepoint_state: Arc<SafepointState>,
    critical: Arc<CriticalRegionTracker>,
    signals: Arc<SignalDispatcher>,
    suspension: Arc<SuspendController>,
    coordinator: SafepointCoordinator,
    collector: Arc<dyn Collector>,
}

impl VmServices {
    /// Wire the components together and start the VM thread.
    pub fn new(config: VmConfig, collector: Arc<dyn Collector>) -> VmResult<Self> {
        config.validate()?;
        let policy = collector.policy();
        if policy != config.policy {
            tracing::debug!(configured = %config.policy, collector = %policy, "collector overrides configured policy");
        }

        let fatal = FatalReporter::new(config.fatal_action);
        let registry = Arc::new(ThreadRegistry::new(fatal));
        let safepoint_state = Arc::new(SafepointState::new());
        let critical = Arc::new(CriticalRegionTracker::new(
            policy,
            Arc::clone(&registry),
            Arc::clone(&safepoint_state),
        ));
        let signals = Arc::new(SignalDispatcher::new(
            Arc::clone(&registry),
            config.os_signal_masks,
        ));
        let suspension = Arc::new(SuspendController::new(
            Arc::clone(&registry),
            Arc::clone(&safepoint_state),
            config.poll_tick,
        ));
        let coordinator = SafepointCoordinator::start(
            config.safepoint_settings(policy),
            Arc::clone(&registry),
            Arc::clone(&critical),
            Arc::clone(&safepoint_state),
            Arc::clone(&collector),
            fatal,
        )?;

        Ok(Self {
            config,
            policy,
            fatal,
            registry,
            safepoint_state,
            critical,
            signals,
            suspension,
            coordinator,
            collector,
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn policy(&self) -> CollectorPolicy {
        self.policy
    }

    pub fn fatal_reporter(&self) -> FatalReporter {
        self.fatal
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    pub fn safepoint_state(&self) -> &Arc<SafepointState> {
        &self.safepoint_state
    }

    pub fn critical(&self) -> &Arc<CriticalRegionTracker> {
        &self.critical
    }

    pub fn signals(&self) -> &Arc<SignalDispatcher> {
        &self.signals
    }

    pub fn suspension(&self) -> &Arc<SuspendController> {
        &self.suspension
    }

    pub fn safepoints(&self) -> &SafepointCoordinator {
        &self.coordinator
    }

    pub fn collector(&self) -> &Arc<dyn Collector> {
        &self.collector
    }
}

impl fmt::Debug for VmServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmServices")
            .field("policy", &self.policy)
            .field("collector", &self.collector.name())
            .field("threads", &self.registry.len())
            .finish()
    }
}
