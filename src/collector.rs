//! The garbage collector as seen from the coordination core.
//!
//! The collector itself is out of scope. It advertises a
//! [`CollectorPolicy`] once at startup and receives a callback while every
//! participating thread is quiesced.

use crate::policy::CollectorPolicy;
use crate::safepoint::SafepointContext;
use std::fmt;

/// Why a collection was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcCause {
    /// Explicit request from managed code.
    SystemGc,
    AllocationFailure,
    /// Requested by a test or a diagnostic command.
    Diagnostic,
}

impl fmt::Display for GcCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcCause::SystemGc => f.write_str("System.gc()"),
            GcCause::AllocationFailure => f.write_str("Allocation Failure"),
            GcCause::Diagnostic => f.write_str("Diagnostic Command"),
        }
    }
}

/// Collector collaborator.
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    /// Queried once when the VM is built.
    fn policy(&self) -> CollectorPolicy;

    /// Run the stop-the-world part of a collection. Called on the VM thread
    /// while the safepoint is active.
    fn collect(&self, cx: &SafepointContext<'_>);
}

/// Collector that does nothing, for embedders that only need safepoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCollector {
    policy: CollectorPolicy,
}

impl NoopCollector {
    pub const fn new(policy: CollectorPolicy) -> Self {
        Self { policy }
    }
}

impl Collector for NoopCollector {
    fn name(&self) -> &str {
        "noop"
    }

    fn policy(&self) -> CollectorPolicy {
        self.policy
    }

    fn collect(&self, cx: &SafepointContext<'_>) {
        tracing::trace!(safepoint = cx.id(), "noop collection");
    }
}
