//! # vmsync
//!
//! Thread coordination core for a managed runtime: the thread registry and
//! state machine, stop-the-world safepoints, JNI critical regions with a
//! per-collector exclusion policy, signal masks and interrupts, external
//! suspension, and a small virtual-thread scheduler.
//!
//! ## Architecture
//!
//! - [`thread`]: thread ids, records, the registry and the state machine
//! - [`safepoint`]: the poll word and the coordinator that runs on the VM thread
//! - [`critical`]: critical-region depth, region pins and the GC locker
//! - [`policy`]: how each collector policy treats critical regions
//! - [`signal`]: per-thread signal masks, delivery and interrupts
//! - [`suspend`]: suspend/resume requests honoured at poll points
//! - [`scheduler`]: virtual threads multiplexed onto carrier threads
//! - [`management`]: thread info, priorities and thread dumps
//! - [`vm`]: the [`Vm`] that wires everything together
//!
//! ## Safety model
//!
//! Misuse that the caller can recover from returns a [`VmError`]. Broken
//! invariants that would let a collector move memory native code still
//! holds (an unbalanced critical exit, leaving native code inside a region
//! under the counted locker, an illegal state transition) go through
//! [`fatal`] and terminate the process after writing a diagnostic dump.
//!
//! ## Quick start
//!
//! ```
//! use vmsync::prelude::*;
//!
//! let vm = Vm::new(VmConfig::default().with_carrier_threads(1)).unwrap();
//!
//! let task = vm
//!     .spawn_virtual("v", |thread: &JavaThread| {
//!         thread.critical(|| assert_eq!(thread.critical_depth(), 1));
//!         Step::Complete
//!     })
//!     .unwrap();
//! task.join().unwrap();
//!
//! vm.collect(GcCause::SystemGc).unwrap();
//! vm.shutdown();
//! ```

pub mod collector;
pub mod config;
pub mod critical;
pub mod error;
pub mod fatal;
pub mod java_thread;
pub mod jni;
pub mod management;
pub mod os;
pub mod policy;
pub mod safepoint;
pub mod scheduler;
pub mod services;
pub mod signal;
pub mod suspend;
pub mod thread;
pub mod vm;

pub use error::{VmError, VmResult};
pub use java_thread::{current_thread_id, pollcheck, JavaThread};
pub use policy::CollectorPolicy;
pub use vm::Vm;

/// Common imports for embedders.
pub mod prelude {
    pub use crate::collector::{Collector, GcCause, NoopCollector};
    pub use crate::config::VmConfig;
    pub use crate::critical::RegionId;
    pub use crate::error::{VmError, VmResult};
    pub use crate::java_thread::{pollcheck, JavaThread};
    pub use crate::jni::{CriticalArray, CriticalSection};
    pub use crate::policy::CollectorPolicy;
    pub use crate::safepoint::{SafepointContext, SafepointReason};
    pub use crate::scheduler::{Step, VirtualThread};
    pub use crate::signal::{Signal, SignalSet, SignalTarget};
    pub use crate::thread::{Priority, ThreadDescriptor, ThreadState, VmThreadId};
    pub use crate::vm::Vm;
}
