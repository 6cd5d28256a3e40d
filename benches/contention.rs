use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use octetlock::{lock_all, Access, Lock};

/// Criterion drives every bench from the same thread; register it once.
fn init_bench_thread() {
    static INIT: Once = Once::new();
    INIT.call_once(octetlock::init_thread);
}

fn owner_hit(criterion: &mut Criterion) {
    init_bench_thread();
    let lock = Lock::new();
    lock.write_lock();

    criterion.bench_function("write_lock/owner_hit", |bencher| {
        bencher.iter(|| black_box(&lock).write_lock());
    });
}

fn grouped_uncontended(criterion: &mut Criterion) {
    init_bench_thread();
    let from = Lock::new();
    let to = Lock::new();
    let audit = Lock::new();

    criterion.bench_function("lock_all/three_uncontended", |bencher| {
        bencher.iter(|| {
            lock_all(black_box(&[
                (&from, Access::Write),
                (&to, Access::Write),
                (&audit, Access::Read),
            ]));
        });
    });
}

fn handoff(criterion: &mut Criterion) {
    init_bench_thread();
    let lock = Arc::new(Lock::new());
    let stop = Arc::new(AtomicBool::new(false));

    let peer = thread::spawn({
        let lock = Arc::clone(&lock);
        let stop = Arc::clone(&stop);
        move || {
            octetlock::init_thread();
            while !stop.load(Ordering::Relaxed) {
                lock.write_lock();
                octetlock::yield_locks();
            }
            octetlock::shutdown_thread();
        }
    });

    criterion.bench_function("write_lock/handoff", |bencher| {
        bencher.iter(|| black_box(&lock).write_lock());
    });

    stop.store(true, Ordering::Relaxed);
    // The peer may still be waiting on our response; keep granting until
    // it gets to the stop flag.
    while !peer.is_finished() {
        octetlock::yield_locks();
        thread::yield_now();
    }
    peer.join().unwrap();
}

criterion_group!(contention, owner_hit, grouped_uncontended, handoff);
criterion_main!(contention);
