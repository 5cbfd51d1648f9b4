use super::{ThreadDescriptor, ThreadRecord, VmThreadId};
use crate::error::{VmError, VmResult};
use crate::fatal::FatalReporter;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Registry of all live VM-attached threads.
///
/// The table is a `BTreeMap` behind a read/write lock: registration and
/// removal hold the write lock for a single insert or remove, and
/// [`snapshot`](Self::snapshot) clones the values under the read lock, so
/// enumeration is an atomic point-in-time view ordered by id.
#[derive(Debug)]
pub struct ThreadRegistry {
    threads: RwLock<BTreeMap<VmThreadId, Arc<ThreadRecord>>>,
    next_id: AtomicU64,
    total_started: AtomicU64,
    peak: AtomicUsize,
    fatal: FatalReporter,
}

impl ThreadRegistry {
    pub fn new(fatal: FatalReporter) -> Self {
        Self {
            threads: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            total_started: AtomicU64::new(0),
            peak: AtomicUsize::new(0),
            fatal,
        }
    }

    /// Create and publish a record. Platform records are bound to the
    /// calling OS thread.
    ///
    /// Ids are never reused: an explicit id must lie above every id issued
    /// so far, and allocated ids continue after the highest explicit one.
    pub fn register(&self, descriptor: ThreadDescriptor) -> VmResult<Arc<ThreadRecord>> {
        let record = {
            let mut threads = self.threads.write();
            let next = self.next_id.load(Ordering::SeqCst);
            let id = match descriptor.id {
                Some(id) if threads.contains_key(&id) => {
                    return Err(VmError::DuplicateRegistration(id));
                }
                // Everything below the high-water mark has been handed out
                // already, or was skipped by an earlier explicit id.
                Some(id) if id.as_u64() < next => return Err(VmError::IdReused(id)),
                Some(id) => id,
                None => VmThreadId::new(next),
            };
            let following = id.as_u64().checked_add(1).ok_or(VmError::IdOutOfRange(id))?;
            self.next_id.store(following, Ordering::SeqCst);

            let record = Arc::new(ThreadRecord::new(id, descriptor, self.fatal));
            threads.insert(id, Arc::clone(&record));
            self.peak.fetch_max(threads.len(), Ordering::Relaxed);
            record
        };

        self.total_started.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(thread = %record.id(), name = record.name(), kind = %record.kind(), "thread registered");
        Ok(record)
    }

    /// Remove a record. A second call for the same id fails.
    pub fn unregister(&self, id: VmThreadId) -> VmResult<Arc<ThreadRecord>> {
        let removed = self.threads.write().remove(&id);
        match removed {
            Some(record) => {
                tracing::debug!(thread = %id, name = record.name(), "thread unregistered");
                Ok(record)
            }
            None => Err(VmError::UnknownThread(id)),
        }
    }

    pub fn get(&self, id: VmThreadId) -> Option<Arc<ThreadRecord>> {
        self.threads.read().get(&id).cloned()
    }

    pub fn lookup(&self, id: VmThreadId) -> VmResult<Arc<ThreadRecord>> {
        self.get(id).ok_or(VmError::UnknownThread(id))
    }

    /// A back-reference for inspection tools that does not keep the record
    /// alive.
    pub fn weak(&self, id: VmThreadId) -> VmResult<WeakThreadRef> {
        let record = self.lookup(id)?;
        Ok(WeakThreadRef {
            id,
            record: Arc::downgrade(&record),
        })
    }

    pub fn contains(&self, id: VmThreadId) -> bool {
        self.threads.read().contains_key(&id)
    }

    /// Point-in-time enumeration ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<ThreadRecord>> {
        self.threads.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<VmThreadId> {
        self.threads.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }

    pub fn total_started(&self) -> u64 {
        self.total_started.load(Ordering::Relaxed)
    }

    pub fn peak_count(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn fatal_reporter(&self) -> FatalReporter {
        self.fatal
    }
}

/// Weak handle held by debugging tools.
#[derive(Debug, Clone)]
pub struct WeakThreadRef {
    id: VmThreadId,
    record: Weak<ThreadRecord>,
}

impl WeakThreadRef {
    pub fn id(&self) -> VmThreadId {
        self.id
    }

    /// The record, while anything still keeps it alive.
    pub fn upgrade(&self) -> Option<Arc<ThreadRecord>> {
        self.record.upgrade()
    }
}
