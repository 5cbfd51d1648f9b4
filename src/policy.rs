//! Collector policies for JNI critical regions.
//!
//! The set of policies is closed: a collector either never moves objects, can
//! pin the regions a critical section touches, or needs every critical
//! section closed before it may run (the counted GC-locker). Each variant
//! maps to one row of a static behaviour table.

use std::fmt;

/// How critical regions are excluded from collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionMechanism {
    /// Critical regions are always safe.
    None,
    /// The region touched by a critical section is pinned in place.
    RegionPin,
    /// A global counter defers the safepoint until it drops to zero.
    GlobalLocker,
}

/// One row of the policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyTraits {
    pub exclusion: ExclusionMechanism,
    /// Whether outermost entries and exits must be tracked per thread.
    pub tracks_thread_status: bool,
    /// Whether a thread sitting in a critical region can be ignored by a
    /// synchronizing safepoint.
    pub critical_thread_is_safe: bool,
    /// Whether a safepoint timeout escalates to a fatal error by default.
    pub escalate_timeouts: bool,
}

const POLICY_TABLE: [PolicyTraits; 3] = [
    // NonMoving
    PolicyTraits {
        exclusion: ExclusionMechanism::None,
        tracks_thread_status: false,
        critical_thread_is_safe: true,
        escalate_timeouts: false,
    },
    // RegionPinning
    PolicyTraits {
        exclusion: ExclusionMechanism::RegionPin,
        tracks_thread_status: false,
        critical_thread_is_safe: true,
        escalate_timeouts: false,
    },
    // CountedLocker
    PolicyTraits {
        exclusion: ExclusionMechanism::GlobalLocker,
        tracks_thread_status: true,
        critical_thread_is_safe: false,
        escalate_timeouts: true,
    },
];

/// Critical-region capability advertised by the collector.
///
/// # Examples
///
/// ```
/// use vmsync::policy::{CollectorPolicy, ExclusionMechanism};
///
/// let policy = CollectorPolicy::CountedLocker;
/// assert_eq!(policy.exclusion(), ExclusionMechanism::GlobalLocker);
/// assert!(policy.tracks_thread_status());
/// assert!(!CollectorPolicy::RegionPinning.requires_global_exclusion());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CollectorPolicy {
    /// Never relocates live objects and never needs a global pause.
    NonMoving = 0,
    /// Pins individual regions during critical use.
    RegionPinning = 1,
    /// Needs a counted global exclusion while any critical region is open.
    #[default]
    CountedLocker = 2,
}

impl CollectorPolicy {
    pub const ALL: [CollectorPolicy; 3] = [
        CollectorPolicy::NonMoving,
        CollectorPolicy::RegionPinning,
        CollectorPolicy::CountedLocker,
    ];

    pub const fn traits(self) -> PolicyTraits {
        POLICY_TABLE[self as usize]
    }

    pub const fn exclusion(self) -> ExclusionMechanism {
        self.traits().exclusion
    }

    pub const fn tracks_thread_status(self) -> bool {
        self.traits().tracks_thread_status
    }

    pub fn requires_global_exclusion(self) -> bool {
        self.exclusion() == ExclusionMechanism::GlobalLocker
    }

    pub fn pins_regions(self) -> bool {
        self.exclusion() == ExclusionMechanism::RegionPin
    }

    pub const fn critical_thread_is_safe(self) -> bool {
        self.traits().critical_thread_is_safe
    }

    /// Leaving native code with open critical regions is fatal only when the
    /// open regions hold the global locker.
    pub fn tolerates_critical_leak(self) -> bool {
        !self.requires_global_exclusion()
    }

    pub const fn escalates_timeouts(self) -> bool {
        self.traits().escalate_timeouts
    }

    pub fn name(self) -> &'static str {
        match self {
            CollectorPolicy::NonMoving => "non-moving",
            CollectorPolicy::RegionPinning => "region-pinning",
            CollectorPolicy::CountedLocker => "counted-locker",
        }
    }
}

impl fmt::Display for CollectorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
