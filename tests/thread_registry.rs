mod common;

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use vmsync::error::VmError;
use vmsync::fatal::FatalReporter;
use vmsync::policy::CollectorPolicy;
use vmsync::thread::{ThreadDescriptor, ThreadKind, ThreadRegistry, ThreadState, VmThreadId};

#[test]
fn registers_and_enumerates_threads() {
    let registry = ThreadRegistry::new(FatalReporter::default());
    registry.register(ThreadDescriptor::platform("a")).unwrap();
    registry.register(ThreadDescriptor::platform("b")).unwrap();

    let names: Vec<_> = registry
        .snapshot()
        .iter()
        .map(|r| r.name().to_string())
        .collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(registry.total_started(), 2);
}

#[test]
fn explicit_ids_are_unique() {
    let registry = ThreadRegistry::new(FatalReporter::default());
    let id = VmThreadId::new(40);
    registry
        .register(ThreadDescriptor::platform("first").with_id(id))
        .unwrap();
    assert_eq!(
        registry
            .register(ThreadDescriptor::platform("second").with_id(id))
            .unwrap_err(),
        VmError::DuplicateRegistration(id)
    );

    let next = registry.register(ThreadDescriptor::platform("third")).unwrap();
    assert!(next.id() > id);
}

#[test]
fn unregistered_id_cannot_be_claimed_by_a_new_thread() {
    let registry = ThreadRegistry::new(FatalReporter::default());
    let original = registry.register(ThreadDescriptor::platform("a")).unwrap();
    let id = original.id();
    let weak = registry.weak(id).unwrap();
    registry.unregister(id).unwrap();

    assert_eq!(
        registry
            .register(ThreadDescriptor::platform("impostor").with_id(id))
            .unwrap_err(),
        VmError::IdReused(id)
    );
    assert!(registry.get(id).is_none());
    assert_eq!(weak.upgrade().map(|r| r.name().to_string()), Some("a".to_string()));

    let fresh = registry.register(ThreadDescriptor::platform("b")).unwrap();
    assert!(fresh.id() > id);
}

#[test]
fn weak_reference_does_not_keep_record_alive() {
    let registry = ThreadRegistry::new(FatalReporter::default());
    let id = registry.register(ThreadDescriptor::platform("w")).unwrap().id();
    let weak = registry.weak(id).unwrap();
    assert_eq!(weak.upgrade().map(|r| r.id()), Some(id));

    registry.unregister(id).unwrap();
    assert!(weak.upgrade().is_none());
    assert_eq!(registry.weak(id).unwrap_err(), VmError::UnknownThread(id));
}

#[test]
fn snapshot_sees_stable_threads_exactly_once_under_churn() {
    let vm = common::vm(CollectorPolicy::NonMoving);
    let stable = 4;
    let ready = Arc::new(Barrier::new(stable + 1));
    let release = Arc::new(Barrier::new(stable + 1));

    let holders: Vec<_> = (0..stable)
        .map(|i| {
            let vm = Arc::clone(&vm);
            let ready = Arc::clone(&ready);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                let thread = vm
                    .attach_current_thread(ThreadDescriptor::platform(format!("stable-{i}")))
                    .unwrap();
                ready.wait();
                release.wait();
                thread.detach().unwrap();
            })
        })
        .collect();
    ready.wait();
    let stable_ids: HashSet<_> = vm.registry().ids().into_iter().collect();
    assert_eq!(stable_ids.len(), stable);

    let churn: Vec<_> = (0..4)
        .map(|i| {
            let vm = Arc::clone(&vm);
            thread::spawn(move || {
                for round in 0..50 {
                    let thread = vm
                        .attach_current_thread(ThreadDescriptor::platform(format!("churn-{i}-{round}")))
                        .unwrap();
                    thread.pollcheck();
                    thread.detach().unwrap();
                }
            })
        })
        .collect();

    for _ in 0..200 {
        let snapshot = vm.registry().snapshot();
        let ids: Vec<_> = snapshot.iter().map(|r| r.id()).collect();
        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len(), "duplicate entries in snapshot");
        assert!(stable_ids.is_subset(&unique));
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    for handle in churn {
        handle.join().unwrap();
    }
    release.wait();
    for handle in holders {
        handle.join().unwrap();
    }
    assert!(vm.registry().is_empty());
    assert_eq!(vm.registry().total_started(), 4 + 4 * 50);
    vm.shutdown();
}

#[test]
fn attach_binds_platform_record_to_calling_thread() {
    let vm = common::vm(CollectorPolicy::RegionPinning);
    let inner = Arc::clone(&vm);
    thread::spawn(move || {
        let thread = inner
            .attach_current_thread(ThreadDescriptor::virtual_thread("forced"))
            .unwrap();
        assert_eq!(thread.kind(), ThreadKind::Platform);
        assert!(thread.record().is_owned_by_current_thread());
        assert_eq!(vmsync::current_thread_id(), Some(thread.id()));
        assert!(matches!(
            inner.attach_current_thread(ThreadDescriptor::platform("again")),
            Err(VmError::DuplicateRegistration(id)) if id == thread.id()
        ));

        let record = Arc::clone(thread.record());
        thread.detach().unwrap();
        assert_eq!(record.state(), ThreadState::Terminated);
        assert_eq!(vmsync::current_thread_id(), None);
    })
    .join()
    .unwrap();
    vm.shutdown();
}
