mod common;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vmsync::error::VmError;
use vmsync::policy::CollectorPolicy;
use vmsync::safepoint::SafepointReason;
use vmsync::thread::{ThreadDescriptor, ThreadState};

#[test]
fn polling_thread_halts_until_resumed() {
    let vm = common::vm(CollectorPolicy::NonMoving);
    let counter = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let (id_tx, id_rx) = flume::bounded(1);

    let worker = {
        let vm = Arc::clone(&vm);
        let counter = Arc::clone(&counter);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let thread = vm
                .attach_current_thread(ThreadDescriptor::platform("worker"))
                .unwrap();
            id_tx.send(thread.id()).unwrap();
            while !stop.load(Ordering::SeqCst) {
                counter.fetch_add(1, Ordering::SeqCst);
                thread.pollcheck();
            }
        })
    };
    let id = id_rx.recv().unwrap();

    let suspension = vm.suspension();
    suspension.suspend(id).unwrap();
    assert!(suspension.wait_for_suspension(id, Duration::from_secs(5)).unwrap());
    assert!(suspension.is_suspended(id).unwrap());
    assert_eq!(vm.registry().lookup(id).unwrap().state(), ThreadState::BlockedAtSafepoint);

    let frozen = counter.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(counter.load(Ordering::SeqCst), frozen);

    // A suspended thread is safe, so safepoints still complete.
    vm.safepoints()
        .request_safepoint(SafepointReason::ThreadDump)
        .wait_timeout(Duration::from_secs(5))
        .expect("suspended thread must not block a safepoint")
        .unwrap();
    assert!(suspension.is_suspended(id).unwrap());

    suspension.resume(id).unwrap();
    common::eventually("worker to make progress", || {
        counter.load(Ordering::SeqCst) > frozen
    });
    assert!(!suspension.is_suspended(id).unwrap());

    stop.store(true, Ordering::SeqCst);
    worker.join().unwrap();
    vm.shutdown();
}

#[test]
fn suspension_inside_critical_region_takes_effect_at_outermost_exit() {
    for policy in CollectorPolicy::ALL {
        let vm = common::vm(policy);
        let (id_tx, id_rx) = flume::bounded(1);
        let (go_tx, go_rx) = flume::bounded::<()>(1);
        let (after_tx, after_rx) = flume::bounded(1);

        let worker = {
            let vm = Arc::clone(&vm);
            thread::spawn(move || {
                let thread = vm
                    .attach_current_thread(ThreadDescriptor::platform("critical"))
                    .unwrap();
                thread.critical(|| {
                    thread.critical(|| {
                        id_tx.send(thread.id()).unwrap();
                        go_rx.recv().unwrap();
                    });
                    // Still inside the outer region: keeps running.
                    assert_eq!(thread.critical_depth(), 1);
                });
                after_tx.send(thread.state()).unwrap();
            })
        };
        let id = id_rx.recv().unwrap();

        vm.suspension().suspend(id).unwrap();
        assert!(!vm
            .suspension()
            .wait_for_suspension(id, Duration::from_millis(20))
            .unwrap());
        assert_eq!(vm.registry().lookup(id).unwrap().state(), ThreadState::InJniCritical);

        go_tx.send(()).unwrap();
        assert!(vm
            .suspension()
            .wait_for_suspension(id, Duration::from_secs(5))
            .unwrap());
        assert!(vm.suspension().is_suspended(id).unwrap(), "{policy}");
        assert!(after_rx.recv_timeout(Duration::from_millis(20)).is_err());

        vm.suspension().resume(id).unwrap();
        assert_eq!(after_rx.recv().unwrap(), ThreadState::RunningJava);
        worker.join().unwrap();
        vm.shutdown();
    }
}

#[test]
fn thread_in_native_halts_on_return() {
    let vm = common::vm(CollectorPolicy::CountedLocker);
    let (id_tx, id_rx) = flume::bounded(1);
    let (go_tx, go_rx) = flume::bounded::<()>(1);
    let (back_tx, back_rx) = flume::bounded(1);

    let worker = {
        let vm = Arc::clone(&vm);
        thread::spawn(move || {
            let thread = vm
                .attach_current_thread(ThreadDescriptor::platform("native"))
                .unwrap();
            thread.call_native(|| {
                id_tx.send(thread.id()).unwrap();
                go_rx.recv().unwrap();
            });
            back_tx.send(()).unwrap();
        })
    };
    let id = id_rx.recv().unwrap();

    vm.suspension().suspend(id).unwrap();
    assert!(vm
        .suspension()
        .wait_for_suspension(id, Duration::from_millis(50))
        .unwrap());
    assert!(!vm.suspension().is_suspended(id).unwrap());

    go_tx.send(()).unwrap();
    common::eventually("thread to halt on native return", || {
        vm.suspension().is_suspended(id).unwrap()
    });
    assert!(back_rx.try_recv().is_err());

    vm.suspension().resume(id).unwrap();
    back_rx.recv().unwrap();
    worker.join().unwrap();
    vm.shutdown();
}

#[test]
fn misuse_is_reported_to_the_caller() {
    let vm = common::vm(CollectorPolicy::RegionPinning);
    let inner = Arc::clone(&vm);
    thread::spawn(move || {
        let thread = inner
            .attach_current_thread(ThreadDescriptor::platform("target"))
            .unwrap();
        let id = thread.id();
        let suspension = inner.suspension();

        assert_eq!(suspension.resume(id), Err(VmError::NotSuspended(id)));
        // Requesting suspension never blocks, even for the caller itself.
        suspension.suspend(id).unwrap();
        assert_eq!(suspension.suspend(id), Err(VmError::AlreadySuspended(id)));
        assert_eq!(suspension.suspended_threads(), vec![id]);
        suspension.resume(id).unwrap();
        thread.pollcheck();
        assert!(suspension.suspended_threads().is_empty());

        let ghost = vmsync::thread::VmThreadId::new(9_999);
        assert_eq!(suspension.suspend(ghost), Err(VmError::UnknownThread(ghost)));
    })
    .join()
    .unwrap();
    vm.shutdown();
}
