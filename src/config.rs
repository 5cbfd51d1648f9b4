//! VM configuration.

use crate::error::{VmError, VmResult};
use crate::fatal::FatalAction;
use crate::policy::CollectorPolicy;
use crate::safepoint::SafepointSettings;
use crate::signal::SignalSet;
use std::time::Duration;

/// Configuration for a [`Vm`](crate::vm::Vm).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use vmsync::config::VmConfig;
/// use vmsync::policy::CollectorPolicy;
///
/// let config = VmConfig::default()
///     .with_policy(CollectorPolicy::RegionPinning)
///     .with_sync_timeout(Duration::from_millis(500))
///     .with_carrier_threads(2);
/// assert!(config.validate().is_ok());
/// assert!(!config.escalates_timeouts());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Used when no collector is supplied; otherwise the collector's own
    /// policy wins.
    pub policy: CollectorPolicy,
    pub sync_timeout: Duration,
    pub locker_timeout: Duration,
    /// `None` follows the policy default.
    pub escalate_timeouts: Option<bool>,
    pub poll_tick: Duration,
    /// Carrier pool size for virtual threads. Zero disables the scheduler.
    pub carrier_threads: usize,
    pub fatal_action: FatalAction,
    /// Mirror installed masks into the OS thread's mask.
    pub os_signal_masks: bool,
    /// Mask helper threads install on themselves.
    pub helper_signal_mask: SignalSet,
}

impl Default for VmConfig {
    fn default() -> Self {
        let safepoint = SafepointSettings::default();
        Self {
            policy: CollectorPolicy::default(),
            sync_timeout: safepoint.sync_timeout,
            locker_timeout: safepoint.locker_timeout,
            escalate_timeouts: None,
            poll_tick: safepoint.poll_tick,
            carrier_threads: num_cpus::get().clamp(1, 8),
            fatal_action: FatalAction::default(),
            os_signal_masks: cfg!(target_os = "linux"),
            helper_signal_mask: SignalSet::SIGINT
                | SignalSet::SIGTERM
                | SignalSet::SIGHUP
                | SignalSet::SIGQUIT,
        }
    }
}

impl VmConfig {
    pub fn with_policy(mut self, policy: CollectorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_locker_timeout(mut self, timeout: Duration) -> Self {
        self.locker_timeout = timeout;
        self
    }

    pub fn with_escalate_timeouts(mut self, escalate: bool) -> Self {
        self.escalate_timeouts = Some(escalate);
        self
    }

    pub fn with_poll_tick(mut self, tick: Duration) -> Self {
        self.poll_tick = tick;
        self
    }

    pub fn with_carrier_threads(mut self, carriers: usize) -> Self {
        self.carrier_threads = carriers;
        self
    }

    pub fn with_fatal_action(mut self, action: FatalAction) -> Self {
        self.fatal_action = action;
        self
    }

    pub fn with_os_signal_masks(mut self, enabled: bool) -> Self {
        self.os_signal_masks = enabled;
        self
    }

    pub fn with_helper_signal_mask(mut self, mask: SignalSet) -> Self {
        self.helper_signal_mask = mask;
        self
    }

    pub fn escalates_timeouts(&self) -> bool {
        self.escalate_timeouts
            .unwrap_or_else(|| self.policy.escalates_timeouts())
    }

    pub fn validate(&self) -> VmResult<()> {
        if self.sync_timeout.is_zero() {
            return Err(VmError::InvalidConfig("sync_timeout must be non-zero".into()));
        }
        if self.locker_timeout.is_zero() {
            return Err(VmError::InvalidConfig("locker_timeout must be non-zero".into()));
        }
        if self.poll_tick.is_zero() || self.poll_tick > self.sync_timeout {
            return Err(VmError::InvalidConfig(
                "poll_tick must be non-zero and no longer than sync_timeout".into(),
            ));
        }
        if self.fatal_action == FatalAction::Exit(0) {
            return Err(VmError::InvalidConfig(
                "fatal_action must exit with a non-zero status".into(),
            ));
        }
        if self.carrier_threads > 1024 {
            return Err(VmError::InvalidConfig(format!(
                "carrier_threads {} exceeds 1024",
                self.carrier_threads
            )));
        }
        Ok(())
    }

    /// Coordinator settings for `policy`, which may differ from
    /// [`policy`](Self::policy) when a collector overrides it.
    pub fn safepoint_settings(&self, policy: CollectorPolicy) -> SafepointSettings {
        SafepointSettings {
            sync_timeout: self.sync_timeout,
            locker_timeout: self.locker_timeout,
            escalate_timeouts: self
                .escalate_timeouts
                .unwrap_or_else(|| policy.escalates_timeouts()),
            poll_tick: self.poll_tick,
        }
    }
}
