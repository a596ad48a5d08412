//! Synchronization primitives for fibers.
//!
//! The std blocking primitives park the whole worker thread; these park only
//! the calling fiber, handing it back to its scheduler when the counterpart
//! operation happens on any thread.
//!
//! - [Cond](struct.Cond.html): condition variable; `wait()` suspends the
//!   fiber until `signal()`/`broadcast()`. No mutex pairing is required; wrap
//!   `wait()` in a predicate loop when spurious wake-ups matter.
//! - [Semaphore](struct.Semaphore.html): counting semaphore with the same
//!   parking behaviour.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;

struct Parked {
    fiber: Arc<Fiber>,
    sched: Scheduler,
}

fn park_current(queue: &Mutex<VecDeque<Parked>>) {
    let fiber = Fiber::current().expect("wait outside of any fiber");
    assert!(
        !fiber.is_thread_main(),
        "the thread-main fiber cannot wait on a fiber primitive"
    );
    let sched = Scheduler::current().expect("wait outside of any scheduler");
    queue.lock().unwrap().push_back(Parked { fiber, sched });
    Fiber::yield_suspended();
}

fn unpark_one(queue: &Mutex<VecDeque<Parked>>) -> bool {
    let parked = queue.lock().unwrap().pop_front();
    match parked {
        Some(p) => {
            p.sched.schedule(p.fiber);
            true
        }
        None => false,
    }
}

/// Condition variable for fibers.
///
/// `signal` wakes one waiter, `broadcast` wakes all of them; neither yields.
/// Waking means re-enqueueing the fiber on the scheduler it waited from.
pub struct Cond {
    waiters: Mutex<VecDeque<Parked>>,
}

impl Cond {
    pub fn new() -> Cond {
        Cond {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Suspend the calling fiber until signalled. Must run inside a fiber on
    /// a scheduler worker.
    pub fn wait(&self) {
        park_current(&self.waiters);
    }

    /// Wake one waiting fiber. Returns false when nobody waits.
    pub fn signal(&self) -> bool {
        unpark_one(&self.waiters)
    }

    /// Wake every waiting fiber.
    pub fn broadcast(&self) {
        while unpark_one(&self.waiters) {}
    }
}

impl Default for Cond {
    fn default() -> Self {
        Cond::new()
    }
}

/// Counting semaphore for fibers.
pub struct Semaphore {
    state: Mutex<SemState>,
}

struct SemState {
    permits: usize,
    waiters: VecDeque<Parked>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Semaphore {
        Semaphore {
            state: Mutex::new(SemState {
                permits,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Take one permit, suspending the calling fiber while none is free.
    pub fn wait(&self) {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.permits > 0 {
                    state.permits -= 1;
                    return;
                }
                let fiber = Fiber::current().expect("wait outside of any fiber");
                assert!(
                    !fiber.is_thread_main(),
                    "the thread-main fiber cannot wait on a fiber primitive"
                );
                let sched = Scheduler::current().expect("wait outside of any scheduler");
                state.waiters.push_back(Parked { fiber, sched });
            }
            Fiber::yield_suspended();
            // woken by post(); retry the permit grab
        }
    }

    /// Try to take a permit without suspending.
    pub fn try_wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.permits > 0 {
            state.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Return one permit, waking one parked fiber if any.
    pub fn post(&self) {
        let woken = {
            let mut state = self.state.lock().unwrap();
            state.permits += 1;
            state.waiters.pop_front()
        };
        if let Some(p) = woken {
            p.sched.schedule(p.fiber);
        }
    }
}
