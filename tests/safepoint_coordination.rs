mod common;

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use vmsync::collector::{Collector, GcCause};
use vmsync::policy::CollectorPolicy;
use vmsync::safepoint::{SafepointContext, SafepointPhase, SafepointReason};
use vmsync::thread::{ThreadDescriptor, ThreadState};
use vmsync::vm::Vm;

/// Records what it saw each time it ran.
#[derive(Default)]
struct RecordingCollector {
    policy: CollectorPolicy,
    runs: AtomicUsize,
    mutators_seen: AtomicUsize,
    unsafe_threads: Mutex<Vec<String>>,
}

impl Collector for RecordingCollector {
    fn name(&self) -> &str {
        "recording"
    }

    fn policy(&self) -> CollectorPolicy {
        self.policy
    }

    fn collect(&self, cx: &SafepointContext<'_>) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let mut unsafe_threads = self.unsafe_threads.lock();
        for record in cx.threads() {
            if record.name().starts_with("mutator-") {
                self.mutators_seen.fetch_add(1, Ordering::SeqCst);
            }
            let state = record.state();
            let tolerated = state == ThreadState::InJniCritical && cx.policy().critical_thread_is_safe();
            if !state.is_safe() && !tolerated {
                unsafe_threads.push(format!("{} {}", record.name(), state));
            }
        }
    }
}

fn spawn_mutators(vm: &Arc<Vm>, count: usize, stop: &Arc<AtomicBool>) -> Vec<thread::JoinHandle<u64>> {
    let started = Arc::new(Barrier::new(count + 1));
    let handles = (0..count)
        .map(|i| {
            let vm = Arc::clone(vm);
            let stop = Arc::clone(stop);
            let started = Arc::clone(&started);
            thread::spawn(move || {
                let thread = vm
                    .attach_current_thread(ThreadDescriptor::platform(format!("mutator-{i}")))
                    .unwrap();
                started.wait();
                let mut iterations = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    iterations += 1;
                    thread.pollcheck();
                    if iterations % 64 == 0 {
                        thread.call_native(std::thread::yield_now);
                    }
                }
                thread.detach().unwrap();
                iterations
            })
        })
        .collect();
    started.wait();
    handles
}

#[test]
fn collector_only_sees_quiesced_threads() {
    common::init_tracing();
    for policy in CollectorPolicy::ALL {
        let collector = Arc::new(RecordingCollector {
            policy,
            ..RecordingCollector::default()
        });
        let vm = Vm::with_collector(common::config(policy), collector.clone()).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let mutators = spawn_mutators(&vm, 4, &stop);

        for _ in 0..10 {
            let outcome = vm.collect(GcCause::Diagnostic).unwrap();
            assert!(outcome.collected);
        }

        stop.store(true, Ordering::Relaxed);
        for handle in mutators {
            assert!(handle.join().unwrap() > 0);
        }
        assert_eq!(collector.runs.load(Ordering::SeqCst), 10, "{policy}");
        assert_eq!(collector.mutators_seen.load(Ordering::SeqCst), 40, "{policy}");
        assert!(collector.unsafe_threads.lock().is_empty(), "{policy}");
        vm.shutdown();
    }
}

#[test]
fn running_thread_stops_on_the_poll_slow_path() {
    let vm = common::vm(CollectorPolicy::NonMoving);
    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = flume::bounded(1);
    let spinner = {
        let vm = Arc::clone(&vm);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let thread = vm
                .attach_current_thread(ThreadDescriptor::platform("spinner"))
                .unwrap();
            ready_tx.send(thread.id()).unwrap();
            while !stop.load(Ordering::Relaxed) {
                thread.pollcheck();
            }
            thread.detach().unwrap();
        })
    };
    let id = ready_rx.recv().unwrap();
    let record = vm.registry().lookup(id).unwrap();

    for round in 1..=3u64 {
        // The spinner never leaves Java, so it can only become safe by polling.
        common::eventually("spinner back in Java", || {
            record.state() == ThreadState::RunningJava
        });
        vm.collect(GcCause::Diagnostic).unwrap();
        assert_eq!(vm.safepoint_state().hits(), round);
    }

    stop.store(true, Ordering::Relaxed);
    spinner.join().unwrap();
    vm.shutdown();
}

#[test]
fn concurrent_requesters_are_all_released() {
    let vm = common::vm(CollectorPolicy::CountedLocker);
    let stop = Arc::new(AtomicBool::new(false));
    let mutators = spawn_mutators(&vm, 2, &stop);

    let requesters = 8;
    let gate = Arc::new(Barrier::new(requesters));
    let handles: Vec<_> = (0..requesters)
        .map(|i| {
            let vm = Arc::clone(&vm);
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let thread = vm
                    .attach_current_thread(ThreadDescriptor::platform(format!("requester-{i}")))
                    .unwrap();
                gate.wait();
                let outcome = thread.request_safepoint(SafepointReason::ThreadDump).unwrap();
                assert_eq!(thread.state(), ThreadState::RunningJava);
                thread.detach().unwrap();
                outcome.safepoint_id
            })
        })
        .collect();

    let ids: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let stats = vm.safepoints().stats();
    assert_eq!(stats.safepoints as usize, ids.len());
    assert_eq!(stats.safepoints + stats.coalesced_requests, requesters as u64);

    stop.store(true, Ordering::Relaxed);
    for handle in mutators {
        handle.join().unwrap();
    }
    assert_eq!(vm.safepoints().phase(), SafepointPhase::Idle);
    vm.shutdown();
}

#[test]
fn operations_run_once_per_request_in_order() {
    let vm = common::vm(CollectorPolicy::RegionPinning);
    let order = Arc::new(Mutex::new(Vec::new()));

    let requests: Vec<_> = (0..5)
        .map(|i| {
            let order = Arc::clone(&order);
            vm.safepoints()
                .request_operation(SafepointReason::Custom(format!("op-{i}")), move |_| {
                    order.lock().push(i);
                })
        })
        .collect();
    let seqs: Vec<_> = requests.iter().map(|r| r.seq()).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    for request in &requests {
        request.wait().unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    vm.shutdown();
}

#[test]
fn thread_in_native_does_not_hold_up_a_safepoint() {
    let vm = common::vm(CollectorPolicy::CountedLocker);
    let (entered_tx, entered_rx) = flume::bounded(1);
    let (leave_tx, leave_rx) = flume::bounded::<()>(1);

    let inner = Arc::clone(&vm);
    let native = thread::spawn(move || {
        let thread = inner
            .attach_current_thread(ThreadDescriptor::platform("native"))
            .unwrap();
        thread.call_native(|| {
            entered_tx.send(()).unwrap();
            leave_rx.recv().unwrap();
        });
        thread.detach().unwrap();
    });

    entered_rx.recv().unwrap();
    let outcome = vm
        .safepoints()
        .request_safepoint(SafepointReason::ThreadDump)
        .wait_timeout(Duration::from_secs(5))
        .expect("native thread should count as safe")
        .unwrap();
    assert_eq!(outcome.batch_size, 1);
    leave_tx.send(()).unwrap();
    native.join().unwrap();
    vm.shutdown();
}
