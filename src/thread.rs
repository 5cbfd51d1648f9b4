//! Thread identities, records and the thread registry.
//!
//! Every thread that touches the managed heap is attached to the VM and owns
//! a [`ThreadRecord`] in the [`ThreadRegistry`]. The owning thread drives its
//! own state through the transition table in [`ThreadState`]; the safepoint
//! coordinator, the signal dispatcher and inspection tools only read.
//!
//! # Examples
//!
//! ```
//! use vmsync::fatal::FatalReporter;
//! use vmsync::thread::{ThreadDescriptor, ThreadRegistry};
//!
//! let registry = ThreadRegistry::new(FatalReporter::default());
//! let first = registry.register(ThreadDescriptor::platform("main")).unwrap();
//! let second = registry.register(ThreadDescriptor::platform("worker")).unwrap();
//!
//! let ids: Vec<_> = registry.snapshot().iter().map(|r| r.id()).collect();
//! assert_eq!(ids, vec![first.id(), second.id()]);
//!
//! registry.unregister(first.id()).unwrap();
//! assert!(registry.unregister(first.id()).is_err());
//! ```

mod priority;
mod record;
mod registry;
mod state;

pub use priority::Priority;
pub use record::ThreadRecord;
pub use registry::{ThreadRegistry, WeakThreadRef};
pub use state::ThreadState;

use crate::signal::SignalSet;
use std::fmt;

/// Stable identity of a VM thread. Never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmThreadId(u64);

impl VmThreadId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VmThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Platform threads map 1:1 to OS threads; virtual threads are mounted on
/// carriers by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadKind {
    Platform,
    Virtual,
}

impl fmt::Display for ThreadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadKind::Platform => f.write_str("platform"),
            ThreadKind::Virtual => f.write_str("virtual"),
        }
    }
}

/// Everything needed to register a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadDescriptor {
    pub name: String,
    pub kind: ThreadKind,
    pub priority: Priority,
    pub daemon: bool,
    pub signal_mask: SignalSet,
    /// Explicit id; allocated by the registry when `None`.
    pub id: Option<VmThreadId>,
}

impl ThreadDescriptor {
    pub fn platform(name: impl Into<String>) -> Self {
        Self::new(name, ThreadKind::Platform)
    }

    pub fn virtual_thread(name: impl Into<String>) -> Self {
        Self::new(name, ThreadKind::Virtual)
    }

    fn new(name: impl Into<String>, kind: ThreadKind) -> Self {
        Self {
            name: name.into(),
            kind,
            priority: Priority::NORM,
            daemon: false,
            signal_mask: SignalSet::empty(),
            id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_signal_mask(mut self, mask: SignalSet) -> Self {
        self.signal_mask = mask;
        self
    }

    pub fn with_id(mut self, id: VmThreadId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn daemon(mut self) -> Self {
        self.daemon = true;
        self
    }
}
