use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier,
    },
    thread,
};
use vmsync::collector::GcCause;
use vmsync::config::VmConfig;
use vmsync::policy::CollectorPolicy;
use vmsync::safepoint::SafepointReason;
use vmsync::thread::ThreadDescriptor;
use vmsync::vm::Vm;

fn vm(policy: CollectorPolicy) -> Arc<Vm> {
    Vm::new(
        VmConfig::default()
            .with_policy(policy)
            .with_carrier_threads(0),
    )
    .unwrap()
}

fn bench_pollcheck_fast_path(c: &mut Criterion) {
    let vm = vm(CollectorPolicy::NonMoving);
    let thread = vm
        .attach_current_thread(ThreadDescriptor::platform("bench"))
        .unwrap();

    c.bench_function("pollcheck_fast_path", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                thread.pollcheck();
            }
        });
    });
    c.bench_function("pollcheck_thread_local", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                vmsync::pollcheck();
            }
        });
    });

    thread.detach().unwrap();
    vm.shutdown();
}

fn bench_critical_enter_exit(c: &mut Criterion) {
    let mut group = c.benchmark_group("critical_enter_exit");
    for policy in CollectorPolicy::ALL {
        let vm = vm(policy);
        let thread = vm
            .attach_current_thread(ThreadDescriptor::platform("bench"))
            .unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(policy), &policy, |b, _| {
            b.iter(|| {
                thread.critical(|| std::hint::black_box(thread.critical_depth()));
            });
        });
        thread.detach().unwrap();
        vm.shutdown();
    }
    group.finish();
}

fn bench_safepoint_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("safepoint_round_trip");
    for mutators in [0usize, 2, 4] {
        let vm = vm(CollectorPolicy::CountedLocker);
        let running = Arc::new(AtomicBool::new(true));
        let ready = Arc::new(Barrier::new(mutators + 1));
        let handles: Vec<_> = (0..mutators)
            .map(|i| {
                let vm = Arc::clone(&vm);
                let running = Arc::clone(&running);
                let ready = Arc::clone(&ready);
                thread::spawn(move || {
                    let thread = vm
                        .attach_current_thread(ThreadDescriptor::platform(format!("mutator-{i}")))
                        .unwrap();
                    ready.wait();
                    while running.load(Ordering::Relaxed) {
                        thread.critical(|| std::hint::black_box(0));
                        thread.pollcheck();
                    }
                    thread.detach().unwrap();
                })
            })
            .collect();
        ready.wait();

        group.bench_with_input(BenchmarkId::from_parameter(mutators), &mutators, |b, _| {
            b.iter(|| {
                vm.safepoints()
                    .request_safepoint(SafepointReason::Collect(GcCause::Diagnostic))
                    .wait()
                    .unwrap()
            });
        });

        running.store(false, Ordering::Relaxed);
        for handle in handles {
            handle.join().unwrap();
        }
        vm.shutdown();
    }
    group.finish();
}

fn bench_registry_snapshot(c: &mut Criterion) {
    let vm = vm(CollectorPolicy::NonMoving);
    for i in 0..64 {
        vm.registry()
            .register(ThreadDescriptor::platform(format!("t{i}")))
            .unwrap();
    }

    c.bench_function("registry_snapshot_64", |b| {
        b.iter(|| std::hint::black_box(vm.registry().snapshot().len()));
    });
    c.bench_function("thread_dump_64", |b| {
        b.iter(|| std::hint::black_box(vm.management().thread_dump().len()));
    });
    vm.shutdown();
}

criterion_group!(
    benches,
    bench_pollcheck_fast_path,
    bench_critical_enter_exit,
    bench_safepoint_round_trip,
    bench_registry_snapshot,
);
criterion_main!(benches);
