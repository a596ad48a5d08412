use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fibrio::ioman::IoManager;
use fibrio::scheduler::Task;
use fibrio::sync::{Cond, Semaphore};

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
fn cond_wakes_one_waiter_per_signal() {
    common::init_logs();
    let iom = IoManager::new(2, false, "sync_cond").unwrap();

    let cond = Arc::new(Cond::new());
    let woken = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let c = cond.clone();
        let w = woken.clone();
        iom.schedule(Task::call(move || {
            c.wait();
            w.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // give all three fibers time to park
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(woken.load(Ordering::SeqCst), 0);

    assert!(cond.signal());
    assert!(wait_until(
        || woken.load(Ordering::SeqCst) == 1,
        Duration::from_secs(2)
    ));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(woken.load(Ordering::SeqCst), 1);

    cond.broadcast();
    assert!(wait_until(
        || woken.load(Ordering::SeqCst) == 3,
        Duration::from_secs(2)
    ));
    assert!(!cond.signal());
    iom.stop();
}

#[test]
fn semaphore_bounds_concurrency() {
    common::init_logs();
    let iom = IoManager::new(2, false, "sync_sem").unwrap();

    let sem = Arc::new(Semaphore::new(1));
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        let sem = sem.clone();
        let inside = inside.clone();
        let peak = peak.clone();
        let done = done.clone();
        iom.schedule(Task::call(move || {
            sem.wait();
            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            fibrio::hook::usleep(20_000);
            inside.fetch_sub(1, Ordering::SeqCst);
            sem.post();
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }

    assert!(wait_until(
        || done.load(Ordering::SeqCst) == 4,
        Duration::from_secs(3)
    ));
    iom.stop();
    assert_eq!(peak.load(Ordering::SeqCst), 1, "semaphore was breached");
}

#[test]
fn try_wait_never_parks() {
    common::init_logs();
    let sem = Semaphore::new(1);
    assert!(sem.try_wait());
    assert!(!sem.try_wait());
    sem.post();
    assert!(sem.try_wait());
}
