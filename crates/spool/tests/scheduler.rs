//! End-to-end scheduler behavior: worker-count bounds, affinity pinning,
//! and fiber resubmission across workers.

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use spool::{current_worker, ScheduleTask, Scheduler};

#[test]
fn test_concurrency_never_exceeds_worker_count() {
    let sched = Scheduler::new(3, false, "pool-bound");
    sched.start();

    let executed = Arc::new(AtomicUsize::new(0));
    let running = Arc::new(AtomicIsize::new(0));
    let peak = Arc::new(AtomicIsize::new(0));

    for _ in 0..100 {
        let executed = Arc::clone(&executed);
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        sched.spawn(move || {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_micros(200));
            running.fetch_sub(1, Ordering::SeqCst);
            executed.fetch_add(1, Ordering::SeqCst);
        });
    }
    sched.stop();

    assert_eq!(executed.load(Ordering::SeqCst), 100);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 3, "peak concurrency {} out of range", peak);
}

#[test]
fn test_affinity_pins_tasks_to_named_worker() {
    let sched = Scheduler::new(4, false, "pool-affinity");
    sched.start();

    let (tx, rx) = mpsc::channel();
    for _ in 0..32 {
        for target in 0..4 {
            let tx = tx.clone();
            sched.schedule_to(
                ScheduleTask::callback(move || {
                    tx.send((target, current_worker())).unwrap();
                }),
                Some(target),
            );
        }
    }
    drop(tx);
    sched.stop();

    let mut seen = 0;
    for (target, worker) in rx {
        assert_eq!(worker, Some(target));
        seen += 1;
    }
    assert_eq!(seen, 128);
}

#[test]
fn test_unpinned_tasks_spread_and_all_run() {
    let sched = Scheduler::new(2, false, "pool-spread");
    sched.start();

    let (tx, rx) = mpsc::channel();
    for _ in 0..64 {
        let tx = tx.clone();
        sched.spawn(move || {
            tx.send(current_worker()).unwrap();
        });
    }
    drop(tx);
    sched.stop();

    let workers: Vec<_> = rx.into_iter().collect();
    assert_eq!(workers.len(), 64);
    for id in &workers {
        assert!(matches!(id, Some(0) | Some(1)));
    }
}

#[test]
fn test_fiber_resubmits_itself_to_run_again() {
    // Yielded fibers are never requeued automatically; a fiber that wants
    // another slice must submit itself before yielding.
    let sched = Arc::new(Scheduler::new(2, false, "pool-resubmit"));
    sched.start();

    let steps = Arc::new(AtomicUsize::new(0));
    let steps2 = Arc::clone(&steps);
    let sched2 = Arc::clone(&sched);
    let (tx, rx) = mpsc::channel();

    let fiber = spool::Fiber::new(
        move || {
            steps2.fetch_add(1, Ordering::SeqCst);
            sched2.schedule(spool::Fiber::current());
            spool::yield_now();
            steps2.fetch_add(1, Ordering::SeqCst);
            tx.send(()).unwrap();
        },
        0,
        true,
    )
    .unwrap();
    sched.schedule(Arc::clone(&fiber));

    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(steps.load(Ordering::SeqCst), 2);
    assert_eq!(fiber.state(), spool::FiberState::Term);
    sched.stop();
}
