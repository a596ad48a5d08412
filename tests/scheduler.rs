use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fibrio::fiber::Fiber;
use fibrio::scheduler::{Scheduler, Task};

mod common;

fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn closures_run_on_worker_threads() {
    common::init_logs();
    let sched = Scheduler::new(2, false, "sched_basic");
    sched.start();

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let c = count.clone();
        sched.schedule(Task::call(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
    }
    assert!(wait_until(
        || count.load(Ordering::SeqCst) == 100,
        Duration::from_secs(5)
    ));
    sched.stop();
    assert_eq!(count.load(Ordering::SeqCst), 100);
}

#[test]
fn use_caller_runs_the_queue_inside_stop() {
    common::init_logs();
    let sched = Scheduler::new(1, true, "sched_caller");
    sched.start(); // no worker threads; nothing runs yet

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let c = count.clone();
        sched.schedule(Task::call(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
    }
    assert_eq!(count.load(Ordering::SeqCst), 0);
    sched.stop();
    assert_eq!(count.load(Ordering::SeqCst), 10);
}

#[test]
fn pinned_runnables_run_on_their_worker() {
    common::init_logs();
    let sched = Scheduler::new(3, false, "sched_pinned");
    sched.start();

    let hits: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    for i in 0..30 {
        let pin = i % 3;
        let h = hits.clone();
        sched.schedule_on(
            Task::call(move || {
                let actual = Scheduler::current_worker().expect("not on a worker");
                h.lock().unwrap().push((pin, actual));
            }),
            Some(pin),
        );
    }
    assert!(wait_until(
        || hits.lock().unwrap().len() == 30,
        Duration::from_secs(5)
    ));
    sched.stop();
    for (pin, actual) in hits.lock().unwrap().iter() {
        assert_eq!(pin, actual);
    }
}

#[test]
fn ready_fibers_are_rescheduled_until_done() {
    common::init_logs();
    let sched = Scheduler::new(1, false, "sched_ready");
    sched.start();

    let passes = Arc::new(AtomicUsize::new(0));
    let p = passes.clone();
    let fiber = Fiber::new(move || {
        for _ in 0..4 {
            p.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_ready();
        }
        p.fetch_add(1, Ordering::SeqCst);
    });
    sched.schedule(fiber.clone());

    assert!(wait_until(
        || passes.load(Ordering::SeqCst) == 5,
        Duration::from_secs(5)
    ));
    sched.stop();
    assert_eq!(fiber.state(), fibrio::fiber::State::Done);
}

#[test]
fn schedule_batch_enqueues_everything() {
    common::init_logs();
    let sched = Scheduler::new(2, false, "sched_batch");
    sched.start();

    let count = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Task> = (0..50)
        .map(|_| {
            let c = count.clone();
            Task::call(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    sched.schedule_batch(tasks);

    assert!(wait_until(
        || count.load(Ordering::SeqCst) == 50,
        Duration::from_secs(5)
    ));
    sched.stop();
}

#[test]
fn fibers_can_suspend_and_be_requeued_by_a_waiter() {
    common::init_logs();
    let sched = Scheduler::new(2, false, "sched_suspend");
    sched.start();

    let stage = Arc::new(AtomicUsize::new(0));
    let s = stage.clone();
    let fiber = Fiber::new(move || {
        s.store(1, Ordering::SeqCst);
        Fiber::yield_suspended();
        s.store(2, Ordering::SeqCst);
    });
    sched.schedule(fiber.clone());

    assert!(wait_until(
        || stage.load(Ordering::SeqCst) == 1,
        Duration::from_secs(5)
    ));
    // the fiber is parked; nothing re-enqueues it until we do
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(stage.load(Ordering::SeqCst), 1);

    sched.schedule(fiber);
    assert!(wait_until(
        || stage.load(Ordering::SeqCst) == 2,
        Duration::from_secs(5)
    ));
    sched.stop();
}
