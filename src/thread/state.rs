//! Thread execution states and the table of legal transitions.

use std::fmt;

/// Execution mode of a VM thread.
///
/// Suspension is not a state: it is an overlay flag on the record, so a
/// thread can be `InNative` and suspended at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ThreadState {
    /// Registered but not started yet.
    #[default]
    New,
    /// Executing managed code; must reach a poll point for a safepoint.
    RunningJava,
    /// Executing native code without touching the managed heap.
    InNative,
    /// Inside one or more JNI critical regions.
    InJniCritical,
    /// Parked at a poll point for a safepoint or a suspension.
    BlockedAtSafepoint,
    /// Virtual thread unmounted from its carrier, or a carrier lending its
    /// OS thread to a mounted virtual thread.
    Parked,
    /// Finished; will never execute managed code again.
    Terminated,
}

impl ThreadState {
    /// Whether `self -> to` is in the transition table.
    ///
    /// `InJniCritical -> InJniCritical` covers nested entries and exits.
    /// Returning from a critical region to the state it was entered from is
    /// checked separately against the remembered prior state.
    ///
    /// # Examples
    ///
    /// ```
    /// use vmsync::thread::ThreadState;
    ///
    /// assert!(ThreadState::RunningJava.can_transition_to(ThreadState::InNative));
    /// assert!(!ThreadState::InJniCritical.can_transition_to(ThreadState::BlockedAtSafepoint));
    /// ```
    pub fn can_transition_to(self, to: ThreadState) -> bool {
        use ThreadState::*;
        matches!(
            (self, to),
            (New, RunningJava)
                | (New, Terminated)
                | (RunningJava, InNative)
                | (InNative, RunningJava)
                | (RunningJava, InJniCritical)
                | (InNative, InJniCritical)
                | (InJniCritical, InJniCritical)
                | (InJniCritical, RunningJava)
                | (InJniCritical, InNative)
                | (RunningJava, BlockedAtSafepoint)
                | (InNative, BlockedAtSafepoint)
                | (BlockedAtSafepoint, RunningJava)
                | (BlockedAtSafepoint, InNative)
                | (RunningJava, Parked)
                | (Parked, RunningJava)
                | (RunningJava, Terminated)
                | (InNative, Terminated)
                | (Parked, Terminated)
        )
    }

    /// Whether a thread in this state can be ignored while a safepoint
    /// synchronizes. `InJniCritical` depends on the collector policy and is
    /// answered by [`crate::policy::CollectorPolicy::critical_thread_is_safe`].
    pub fn is_safe(self) -> bool {
        !matches!(self, ThreadState::RunningJava | ThreadState::InJniCritical)
    }

    pub fn is_alive(self) -> bool {
        !matches!(self, ThreadState::New | ThreadState::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThreadState::New => "NEW",
            ThreadState::RunningJava => "RUNNING_JAVA",
            ThreadState::InNative => "IN_NATIVE",
            ThreadState::InJniCritical => "IN_JNI_CRITICAL",
            ThreadState::BlockedAtSafepoint => "BLOCKED_AT_SAFEPOINT",
            ThreadState::Parked => "PARKED",
            ThreadState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
