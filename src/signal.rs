//! Per-thread signal masks, signal routing and thread interrupts.
//!
//! Signals are modelled the POSIX way: each thread carries a blocked set,
//! thread-directed signals stay pending on their target until unblocked and
//! taken, and process-directed signals go to the lowest-id thread that does
//! not block them. When no thread accepts a process-directed signal it stays
//! process-pending and is claimed by the first thread that unblocks it.

use crate::error::{VmError, VmResult};
use crate::os;
use crate::thread::{ThreadKind, ThreadRecord, ThreadRegistry, ThreadState, VmThreadId};
use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

bitflags! {
    /// A set of signals, bit `n - 1` standing for signal number `n`.
    ///
    /// Numbering follows Linux.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SignalSet: u64 {
        const SIGHUP = 1 << 0;
        const SIGINT = 1 << 1;
        const SIGQUIT = 1 << 2;
        const SIGABRT = 1 << 5;
        const SIGKILL = 1 << 8;
        const SIGUSR1 = 1 << 9;
        const SIGUSR2 = 1 << 11;
        const SIGPIPE = 1 << 12;
        const SIGALRM = 1 << 13;
        const SIGTERM = 1 << 14;
        const SIGCHLD = 1 << 16;
        const SIGCONT = 1 << 17;
        const SIGSTOP = 1 << 18;
        const SIGWINCH = 1 << 27;

        const _ = !0;
    }
}

impl SignalSet {
    /// Signals that can never be blocked.
    pub const UNBLOCKABLE: SignalSet = SignalSet::SIGKILL.union(SignalSet::SIGSTOP);

    pub fn contains_signal(self, signal: Signal) -> bool {
        self.contains(signal.as_set())
    }

    /// Signal numbers in the set, ascending.
    pub fn numbers(self) -> impl Iterator<Item = i32> {
        (1..=Signal::MAX).filter(move |n| self.bits() & (1u64 << (n - 1)) != 0)
    }
}

impl From<Signal> for SignalSet {
    fn from(signal: Signal) -> Self {
        signal.as_set()
    }
}

/// A single signal number in `1..=64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signal(i32);

impl Signal {
    pub const MAX: i32 = 64;

    pub const SIGHUP: Signal = Signal(1);
    pub const SIGINT: Signal = Signal(2);
    pub const SIGQUIT: Signal = Signal(3);
    pub const SIGKILL: Signal = Signal(9);
    pub const SIGUSR1: Signal = Signal(10);
    pub const SIGUSR2: Signal = Signal(12);
    pub const SIGTERM: Signal = Signal(15);

    pub fn new(number: i32) -> VmResult<Self> {
        if (1..=Self::MAX).contains(&number) {
            Ok(Self(number))
        } else {
            Err(VmError::InvalidSignal(number))
        }
    }

    pub const fn number(self) -> i32 {
        self.0
    }

    pub const fn as_set(self) -> SignalSet {
        SignalSet::from_bits_retain(1u64 << (self.0 - 1))
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            1 => "SIGHUP",
            2 => "SIGINT",
            3 => "SIGQUIT",
            6 => "SIGABRT",
            9 => "SIGKILL",
            10 => "SIGUSR1",
            12 => "SIGUSR2",
            13 => "SIGPIPE",
            14 => "SIGALRM",
            15 => "SIGTERM",
            17 => "SIGCHLD",
            18 => "SIGCONT",
            19 => "SIGSTOP",
            28 => "SIGWINCH",
            n => return write!(f, "SIG{n}"),
        };
        f.write_str(name)
    }
}

/// Where a signal is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    Thread(VmThreadId),
    Process,
}

/// Result of routing one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Pending on a thread that does not block it.
    Delivered(VmThreadId),
    /// Pending on a thread that currently blocks it.
    Blocked(VmThreadId),
    /// No thread accepts it; pending on the process.
    ProcessPending,
}

#[derive(Debug)]
pub struct SignalDispatcher {
    registry: Arc<ThreadRegistry>,
    process_pending: AtomicU64,
    os_masks: bool,
}

impl SignalDispatcher {
    pub fn new(registry: Arc<ThreadRegistry>, os_masks: bool) -> Self {
        Self {
            registry,
            process_pending: AtomicU64::new(0),
            os_masks,
        }
    }

    /// Replace the blocked set of `thread`, returning the previous one.
    ///
    /// Only the owning thread may install its mask. `SIGKILL` and `SIGSTOP`
    /// are silently dropped from the set.
    pub fn install_mask(&self, thread: VmThreadId, mask: SignalSet) -> VmResult<SignalSet> {
        let record = self.registry.lookup(thread)?;
        if !record.is_owned_by_current_thread() {
            return Err(VmError::NotOwner {
                thread,
                operation: "install_mask",
            });
        }
        Ok(self.install_on(&record, mask))
    }

    pub(crate) fn install_on(&self, record: &ThreadRecord, mask: SignalSet) -> SignalSet {
        let mask = mask.difference(SignalSet::UNBLOCKABLE);
        let previous = record.store_signal_mask(mask);

        // Virtual threads share their carrier's OS thread.
        if self.os_masks && record.kind() == ThreadKind::Platform {
            if let Err(err) = os::set_thread_sigmask(mask) {
                tracing::warn!(thread = %record.id(), %err, "failed to update OS signal mask");
            }
        }

        self.claim_process_pending(record);
        tracing::debug!(thread = %record.id(), ?previous, ?mask, "signal mask installed");
        previous
    }

    /// The calling OS thread's mask before the VM changes it, when OS masks
    /// are mirrored.
    pub(crate) fn capture_os_mask(&self) -> Option<SignalSet> {
        if !self.os_masks {
            return None;
        }
        match os::thread_sigmask() {
            Ok(mask) => Some(mask),
            Err(err) => {
                tracing::warn!(%err, "failed to read OS signal mask");
                None
            }
        }
    }

    pub(crate) fn restore_os_mask(&self, record: &ThreadRecord, saved: Option<SignalSet>) {
        let Some(mask) = saved else {
            return;
        };
        match os::set_thread_sigmask(mask) {
            Ok(_) => tracing::trace!(thread = %record.id(), ?mask, "OS signal mask restored"),
            Err(err) => tracing::warn!(thread = %record.id(), %err, "failed to restore OS signal mask"),
        }
    }

    pub fn current_mask(&self, thread: VmThreadId) -> VmResult<SignalSet> {
        Ok(self.registry.lookup(thread)?.signal_mask())
    }

    pub fn deliver(&self, signal: Signal, target: SignalTarget) -> VmResult<Delivery> {
        let delivery = match target {
            SignalTarget::Thread(id) => {
                let record = self.registry.lookup(id)?;
                record.add_pending_signals(signal.as_set());
                if record.signal_mask().contains_signal(signal) {
                    Delivery::Blocked(id)
                } else {
                    record.notify();
                    Delivery::Delivered(id)
                }
            }
            SignalTarget::Process => {
                let receiver = self.registry.snapshot().into_iter().find(|record| {
                    record.state() != ThreadState::Terminated
                        && !record.signal_mask().contains_signal(signal)
                });
                match receiver {
                    Some(record) => {
                        record.add_pending_signals(signal.as_set());
                        record.notify();
                        Delivery::Delivered(record.id())
                    }
                    None => {
                        self.process_pending
                            .fetch_or(signal.as_set().bits(), Ordering::SeqCst);
                        Delivery::ProcessPending
                    }
                }
            }
        };
        tracing::trace!(%signal, ?target, ?delivery, "signal routed");
        Ok(delivery)
    }

    /// Remove and return the signals `record` can take now.
    pub(crate) fn take_signals(&self, record: &ThreadRecord) -> SignalSet {
        self.claim_process_pending(record);
        record.take_deliverable_signals()
    }

    pub fn process_pending(&self) -> SignalSet {
        SignalSet::from_bits_retain(self.process_pending.load(Ordering::SeqCst))
    }

    pub fn pending_signals(&self, thread: VmThreadId) -> VmResult<SignalSet> {
        Ok(self.registry.lookup(thread)?.pending_signals())
    }

    fn claim_process_pending(&self, record: &ThreadRecord) {
        let accepted = !record.signal_mask().bits();
        let claimed = self.process_pending.fetch_and(!accepted, Ordering::SeqCst) & accepted;
        if claimed != 0 {
            record.add_pending_signals(SignalSet::from_bits_retain(claimed));
        }
    }

    // ---- interrupts ---------------------------------------------------------

    /// Set the interrupt flag and wake the thread if it sleeps.
    pub fn interrupt(&self, thread: VmThreadId) -> VmResult<()> {
        let record = self.registry.lookup(thread)?;
        record.set_interrupted(true);
        record.notify();
        tracing::debug!(thread = %thread, "thread interrupted");
        Ok(())
    }

    pub fn is_interrupted(&self, thread: VmThreadId) -> VmResult<bool> {
        Ok(self.registry.lookup(thread)?.is_interrupted())
    }

    /// Test and clear.
    pub(crate) fn interrupted(&self, record: &ThreadRecord) -> bool {
        record.set_interrupted(false)
    }

    /// Sleep on the thread's monitor. Returns `true`, clearing the flag,
    /// when the sleep ended because of an interrupt.
    pub(crate) fn sleep(&self, record: &ThreadRecord, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = record.lock_monitor();
        loop {
            if record.set_interrupted(false) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            record.wait_on_monitor(&mut guard, deadline - now);
        }
    }
}
