use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fibrio::fiber::{Fiber, State};

mod common;

#[test]
fn resume_runs_to_yield_then_to_completion() {
    common::init_logs();
    let steps: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let inner = steps.clone();
    let fiber = Fiber::new(move || {
        inner.lock().unwrap().push("first");
        Fiber::yield_ready();
        inner.lock().unwrap().push("second");
    });

    assert_eq!(fiber.state(), State::Suspended);
    fiber.resume();
    assert_eq!(fiber.state(), State::Ready);
    steps.lock().unwrap().push("between");
    fiber.resume();
    assert_eq!(fiber.state(), State::Done);
    assert_eq!(*steps.lock().unwrap(), ["first", "between", "second"]);
}

#[test]
fn yield_suspended_parks_the_fiber() {
    common::init_logs();
    let fiber = Fiber::new(|| {
        Fiber::yield_suspended();
    });
    fiber.resume();
    assert_eq!(fiber.state(), State::Suspended);
    fiber.resume();
    assert_eq!(fiber.state(), State::Done);
}

#[test]
fn panicking_closure_marks_failed_without_unwinding_the_thread() {
    common::init_logs();
    let fiber = Fiber::new(|| panic!("intentional test panic"));
    fiber.resume();
    assert_eq!(fiber.state(), State::Failed);
    // the host thread is fine
    assert!(Fiber::current().unwrap().is_thread_main());
}

#[test]
fn reset_reuses_the_fiber_for_a_new_closure() {
    common::init_logs();
    let count = Arc::new(AtomicUsize::new(0));

    let c = count.clone();
    let fiber = Fiber::new(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    fiber.resume();
    assert_eq!(fiber.state(), State::Done);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let c = count.clone();
    fiber.reset(move || {
        c.fetch_add(10, Ordering::SeqCst);
    });
    assert_eq!(fiber.state(), State::Suspended);
    fiber.resume();
    assert_eq!(fiber.state(), State::Done);
    assert_eq!(count.load(Ordering::SeqCst), 11);
}

#[test]
fn current_points_at_the_running_fiber() {
    common::init_logs();
    let seen = Arc::new(Mutex::new(None));
    let inner = seen.clone();
    let fiber = Fiber::new(move || {
        let cur = Fiber::current().unwrap();
        assert!(!cur.is_thread_main());
        *inner.lock().unwrap() = Some(cur.id());
    });
    let id = fiber.id();
    fiber.resume();
    assert_eq!(*seen.lock().unwrap(), Some(id));
    // back on the thread-main fiber
    assert!(Fiber::current().unwrap().is_thread_main());
}

#[test]
fn ids_are_unique() {
    common::init_logs();
    let a = Fiber::new(|| {});
    let b = Fiber::new(|| {});
    assert_ne!(a.id(), b.id());
}

#[test]
fn deep_call_stack_fits_in_a_custom_stack() {
    common::init_logs();
    fn burn(depth: usize) -> usize {
        // defeat tail-call shaping with a data dependency
        if depth == 0 {
            0
        } else {
            burn(depth - 1) + 1
        }
    }
    let out = Arc::new(AtomicUsize::new(0));
    let inner = out.clone();
    let fiber = Fiber::with_stack_size(
        move || {
            inner.store(burn(1000), Ordering::SeqCst);
        },
        256 * 1024,
    );
    fiber.resume();
    assert_eq!(fiber.state(), State::Done);
    assert_eq!(out.load(Ordering::SeqCst), 1000);
}
