//! Read-mostly management API over the thread registry.
//!
//! Everything here reads the same [`ThreadRecord`]s the runtime itself
//! uses, so a priority set through [`ThreadManagement::set_priority`] is
//! observed identically by the registry, [`ThreadInfo`] and the rendered
//! [`ThreadDump`].

use crate::error::VmResult;
use crate::thread::{Priority, ThreadKind, ThreadRecord, ThreadRegistry, ThreadState, VmThreadId};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Point-in-time description of one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: VmThreadId,
    pub name: String,
    pub kind: ThreadKind,
    pub state: ThreadState,
    pub priority: i32,
    pub os_priority: i32,
    pub daemon: bool,
    pub critical_depth: u32,
    pub suspended: bool,
    pub interrupted: bool,
    pub carrier: Option<VmThreadId>,
}

impl ThreadInfo {
    fn of(record: &ThreadRecord) -> Self {
        let priority = record.priority();
        Self {
            id: record.id(),
            name: record.name().to_string(),
            kind: record.kind(),
            state: record.state(),
            priority: priority.get(),
            os_priority: priority.os_priority(),
            daemon: record.is_daemon(),
            critical_depth: record.critical_depth(),
            suspended: record.is_suspend_requested(),
            interrupted: record.is_interrupted(),
            carrier: record.carrier(),
        }
    }
}

impl fmt::Display for ThreadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" #{} ", self.name, self.id.as_u64())?;
        if self.daemon {
            f.write_str("daemon ")?;
        }
        write!(
            f,
            "prio={} os_prio={} {} {} depth={}",
            self.priority, self.os_priority, self.kind, self.state, self.critical_depth
        )?;
        if self.suspended {
            f.write_str(" suspended")?;
        }
        if let Some(carrier) = self.carrier {
            write!(f, " carrier={carrier}")?;
        }
        Ok(())
    }
}

/// Every registered thread at one instant, ordered by id.
#[derive(Debug, Clone)]
pub struct ThreadDump {
    taken_at: SystemTime,
    threads: Vec<ThreadInfo>,
}

impl ThreadDump {
    pub fn threads(&self) -> &[ThreadInfo] {
        &self.threads
    }

    pub fn taken_at(&self) -> SystemTime {
        self.taken_at
    }

    pub fn find(&self, id: VmThreadId) -> Option<&ThreadInfo> {
        self.threads
            .binary_search_by_key(&id, |info| info.id)
            .ok()
            .map(|index| &self.threads[index])
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

impl fmt::Display for ThreadDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Full thread dump ({} threads):", self.threads.len())?;
        for info in &self.threads {
            writeln!(f)?;
            writeln!(f, "{info}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ThreadManagement {
    registry: Arc<ThreadRegistry>,
}

impl ThreadManagement {
    pub fn new(registry: Arc<ThreadRegistry>) -> Self {
        Self { registry }
    }

    pub fn thread_ids(&self) -> Vec<VmThreadId> {
        self.registry.ids()
    }

    pub fn thread_info(&self, id: VmThreadId) -> VmResult<ThreadInfo> {
        let record = self.registry.lookup(id)?;
        Ok(ThreadInfo::of(&record))
    }

    pub fn all_thread_info(&self) -> Vec<ThreadInfo> {
        self.registry
            .snapshot()
            .iter()
            .map(|record| ThreadInfo::of(record))
            .collect()
    }

    pub fn priority(&self, id: VmThreadId) -> VmResult<i32> {
        Ok(self.registry.lookup(id)?.priority().get())
    }

    /// Validates the range before touching the record.
    pub fn set_priority(&self, id: VmThreadId, priority: i32) -> VmResult<()> {
        let priority = Priority::new(priority)?;
        let record = self.registry.lookup(id)?;
        record.set_priority(priority);
        tracing::debug!(thread = %id, %priority, "priority changed");
        Ok(())
    }

    pub fn thread_count(&self) -> usize {
        self.registry.len()
    }

    pub fn daemon_thread_count(&self) -> usize {
        self.registry
            .snapshot()
            .iter()
            .filter(|record| record.is_daemon())
            .count()
    }

    pub fn peak_thread_count(&self) -> usize {
        self.registry.peak_count()
    }

    pub fn total_started_thread_count(&self) -> u64 {
        self.registry.total_started()
    }

    pub fn thread_dump(&self) -> ThreadDump {
        ThreadDump {
            taken_at: SystemTime::now(),
            threads: self.all_thread_info(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VmError;
    use crate::fatal::{FatalAction, FatalReporter};
    use crate::thread::ThreadDescriptor;

    fn management() -> (Arc<ThreadRegistry>, ThreadManagement) {
        let registry = Arc::new(ThreadRegistry::new(FatalReporter::new(FatalAction::Panic)));
        (Arc::clone(&registry), ThreadManagement::new(registry))
    }

    #[test]
    fn set_priority_is_visible_everywhere() {
        let (registry, management) = management();
        let id = registry.register(ThreadDescriptor::platform("worker")).unwrap().id();

        management.set_priority(id, 8).unwrap();
        assert_eq!(registry.lookup(id).unwrap().priority().get(), 8);
        assert_eq!(management.priority(id).unwrap(), 8);
        let dump = management.thread_dump();
        assert_eq!(dump.find(id).unwrap().priority, 8);
        assert!(dump.to_string().contains("prio=8 os_prio=-3"));
    }

    #[test]
    fn thread_info_reads_the_live_record() {
        let (registry, management) = management();
        let record = registry
            .register(ThreadDescriptor::platform("info").daemon())
            .unwrap();
        record.transition(ThreadState::RunningJava, "start");

        let info = management.thread_info(record.id()).unwrap();
        assert_eq!(info.name, "info");
        assert_eq!(info.state, ThreadState::RunningJava);
        assert!(info.daemon);
        assert_eq!(info.critical_depth, 0);
        assert_eq!(
            management.thread_info(VmThreadId::new(404)),
            Err(VmError::UnknownThread(VmThreadId::new(404)))
        );
    }

    #[test]
    fn out_of_range_priority_leaves_record_untouched() {
        let (registry, management) = management();
        let id = registry.register(ThreadDescriptor::platform("worker")).unwrap().id();

        assert_eq!(management.set_priority(id, 11), Err(VmError::InvalidPriority(11)));
        assert_eq!(management.priority(id).unwrap(), Priority::NORM.get());
        assert_eq!(
            management.set_priority(VmThreadId::new(404), 3),
            Err(VmError::UnknownThread(VmThreadId::new(404)))
        );
    }

    #[test]
    fn dump_lines_follow_registry_order() {
        let (registry, management) = management();
        registry
            .register(ThreadDescriptor::platform("main").with_priority(Priority::MAX))
            .unwrap();
        registry
            .register(ThreadDescriptor::platform("Signal Dispatcher").daemon())
            .unwrap();

        let rendered = management.thread_dump().to_string();
        let lines: Vec<_> = rendered.lines().filter(|l| l.starts_with('"')).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("\"main\" #1 prio=10 os_prio=-5 platform"));
        assert!(lines[1].starts_with("\"Signal Dispatcher\" #2 daemon prio=5"));
        assert_eq!(management.daemon_thread_count(), 1);
        assert_eq!(management.thread_count(), 2);
    }
}
