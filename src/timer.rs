//! Deadline timers.
//!
//! A [TimerManager](struct.TimerManager.html) keeps an ordered set of
//! deadlines on the monotonic clock. Whoever drives the manager (the I/O
//! scheduler) polls [next_timer_ms](struct.TimerManager.html#method.next_timer_ms)
//! to size its `epoll_wait` timeout and drains due callbacks with
//! [expired_callbacks](struct.TimerManager.html#method.expired_callbacks).
//!
//! Inserting a deadline in front of all existing ones calls the registered
//! [Wakeable](trait.Wakeable.html) so a worker parked in `epoll_wait` can
//! recompute its timeout. A latch suppresses repeated wake-ups between two
//! `next_timer_ms` polls: without it a burst of front insertions while a
//! worker sleeps would write the self-pipe once per insertion for a single
//! recomputation.
//!
//! A *condition timer* carries a weak reference; if the referent is gone by
//! the time the deadline fires, the callback is skipped. The I/O hooks use
//! this so a timeout whose waiter already completed does nothing.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::clock;

/// Fired when a timer becomes the new front deadline.
pub(crate) trait Wakeable: Send + Sync {
    fn wake(&self);
}

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Milliseconds after which a backwards clock step is treated as a rollback:
/// every pending timer fires. Unreachable with a monotonic source; kept for
/// portability of the deadline math.
const ROLLBACK_WINDOW_MS: u64 = 60 * 60 * 1000;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

struct TimerEntry {
    id: u64,
    interval_ms: AtomicU64,
    deadline: AtomicU64,
    recurring: bool,
    /// Taken on cancel and on one-shot expiry; `None` means the timer can no
    /// longer fire.
    cb: Mutex<Option<TimerCallback>>,
}

impl TimerEntry {
    fn key(&self) -> (u64, u64) {
        (self.deadline.load(Ordering::SeqCst), self.id)
    }
}

struct TimerSet {
    timers: RwLock<BTreeMap<(u64, u64), Arc<TimerEntry>>>,
    /// Raised when the front-insert wake has been delivered and not yet
    /// consumed by `next_timer_ms`.
    tickled: AtomicBool,
    last_seen_ms: AtomicU64,
    waker: RwLock<Weak<dyn Wakeable>>,
}

/// Handle to a pending timer, returned by the add methods.
#[derive(Clone)]
pub struct Timer {
    entry: Arc<TimerEntry>,
    set: Weak<TimerSet>,
}

impl Timer {
    /// Remove the timer. Returns false when it already fired (one-shot) or
    /// was already cancelled.
    pub fn cancel(&self) -> bool {
        let set = match self.set.upgrade() {
            Some(s) => s,
            None => return false,
        };
        let mut timers = set.timers.write().unwrap();
        if self.entry.cb.lock().unwrap().take().is_none() {
            return false;
        }
        timers.remove(&self.entry.key()).is_some()
    }

    /// Slide the deadline to now + interval, keeping the interval.
    pub fn refresh(&self) -> bool {
        let set = match self.set.upgrade() {
            Some(s) => s,
            None => return false,
        };
        let mut timers = set.timers.write().unwrap();
        if self.entry.cb.lock().unwrap().is_none() {
            return false;
        }
        if timers.remove(&self.entry.key()).is_none() {
            return false;
        }
        let deadline = clock::monotonic_ms() + self.entry.interval_ms.load(Ordering::SeqCst);
        self.entry.deadline.store(deadline, Ordering::SeqCst);
        timers.insert(self.entry.key(), self.entry.clone());
        true
    }

    /// Change the interval; with `from_now` the deadline is rebased on the
    /// current time, otherwise it keeps its original start point.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        if ms == self.entry.interval_ms.load(Ordering::SeqCst) && !from_now {
            return true;
        }
        let set = match self.set.upgrade() {
            Some(s) => s,
            None => return false,
        };
        let need_wake = {
            let mut timers = set.timers.write().unwrap();
            if self.entry.cb.lock().unwrap().is_none() {
                return false;
            }
            if timers.remove(&self.entry.key()).is_none() {
                return false;
            }
            let start = if from_now {
                clock::monotonic_ms()
            } else {
                self.entry
                    .deadline
                    .load(Ordering::SeqCst)
                    .saturating_sub(self.entry.interval_ms.load(Ordering::SeqCst))
            };
            self.entry.interval_ms.store(ms, Ordering::SeqCst);
            self.entry.deadline.store(start + ms, Ordering::SeqCst);
            set.insert_locked(&mut timers, self.entry.clone())
        };
        if need_wake {
            set.notify();
        }
        true
    }
}

impl TimerSet {
    /// Insert under an already-held write lock; returns whether the waker
    /// needs to run once the lock is released.
    fn insert_locked(
        &self,
        timers: &mut BTreeMap<(u64, u64), Arc<TimerEntry>>,
        entry: Arc<TimerEntry>,
    ) -> bool {
        let key = entry.key();
        timers.insert(key, entry);
        let at_front = timers.keys().next() == Some(&key);
        at_front && !self.tickled.swap(true, Ordering::SeqCst)
    }

    fn notify(&self) {
        if let Some(waker) = self.waker.read().unwrap().upgrade() {
            waker.wake();
        }
    }
}

pub struct TimerManager {
    set: Arc<TimerSet>,
}

impl TimerManager {
    pub(crate) fn new() -> TimerManager {
        TimerManager {
            set: Arc::new(TimerSet {
                timers: RwLock::new(BTreeMap::new()),
                tickled: AtomicBool::new(false),
                last_seen_ms: AtomicU64::new(clock::monotonic_ms()),
                waker: RwLock::new(Weak::<NoopWake>::new()),
            }),
        }
    }

    pub(crate) fn set_waker(&self, waker: Weak<dyn Wakeable>) {
        *self.set.waker.write().unwrap() = waker;
    }

    /// Arm a timer `ms` from now.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_entry(ms, Arc::new(cb), recurring)
    }

    /// Arm a timer whose callback only runs if `cond` is still alive when the
    /// deadline fires.
    pub fn add_condition_timer<F>(
        &self,
        ms: u64,
        cb: F,
        cond: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_entry(
            ms,
            Arc::new(move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            }),
            recurring,
        )
    }

    fn add_entry(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        let entry = Arc::new(TimerEntry {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            interval_ms: AtomicU64::new(ms),
            deadline: AtomicU64::new(clock::monotonic_ms() + ms),
            recurring,
            cb: Mutex::new(Some(cb)),
        });
        let need_wake = {
            let mut timers = self.set.timers.write().unwrap();
            self.set.insert_locked(&mut timers, entry.clone())
        };
        if need_wake {
            self.set.notify();
        }
        Timer {
            entry,
            set: Arc::downgrade(&self.set),
        }
    }

    /// Milliseconds until the next deadline: 0 when overdue, `u64::MAX` when
    /// no timer is armed. Consumes the front-insert wake latch.
    pub fn next_timer_ms(&self) -> u64 {
        let timers = self.set.timers.read().unwrap();
        self.set.tickled.store(false, Ordering::SeqCst);
        match timers.keys().next() {
            None => u64::MAX,
            Some(&(deadline, _)) => {
                let now = clock::monotonic_ms();
                if now >= deadline {
                    0
                } else {
                    deadline - now
                }
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.set.timers.read().unwrap().is_empty()
    }

    /// Drain every timer with deadline <= now, re-inserting recurring ones
    /// with a fresh deadline, and return their callbacks in deadline order.
    pub(crate) fn expired_callbacks(&self) -> Vec<TimerCallback> {
        let now = clock::monotonic_ms();
        {
            if self.set.timers.read().unwrap().is_empty() {
                self.set.last_seen_ms.store(now, Ordering::SeqCst);
                return Vec::new();
            }
        }

        let mut timers = self.set.timers.write().unwrap();
        let rollback = self.detect_rollback(now);
        if !rollback {
            match timers.keys().next() {
                Some(&(deadline, _)) if deadline > now => return Vec::new(),
                None => return Vec::new(),
                _ => {}
            }
        }

        let remaining = if rollback {
            BTreeMap::new()
        } else {
            timers.split_off(&(now + 1, 0))
        };
        let expired: Vec<Arc<TimerEntry>> = timers.values().cloned().collect();
        *timers = remaining;

        let mut cbs = Vec::with_capacity(expired.len());
        for entry in expired {
            let mut slot = entry.cb.lock().unwrap();
            let cb = match slot.as_ref() {
                Some(cb) => cb.clone(),
                None => continue, // cancelled between drain passes
            };
            cbs.push(cb);
            if entry.recurring {
                entry
                    .deadline
                    .store(now + entry.interval_ms.load(Ordering::SeqCst), Ordering::SeqCst);
                drop(slot);
                timers.insert(entry.key(), entry);
            } else {
                *slot = None;
            }
        }
        cbs
    }

    fn detect_rollback(&self, now: u64) -> bool {
        let last = self.set.last_seen_ms.swap(now, Ordering::SeqCst);
        now < last.saturating_sub(ROLLBACK_WINDOW_MS)
    }
}

struct NoopWake;

impl Wakeable for NoopWake {
    fn wake(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> TimerManager {
        TimerManager::new()
    }

    #[test]
    fn next_timer_ms_empty_is_max() {
        let tm = manager();
        assert_eq!(tm.next_timer_ms(), u64::MAX);
    }

    #[test]
    fn cancel_before_fire_is_true_then_false() {
        let tm = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = tm.add_timer(
            10_000,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert!(tm.has_timer());
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!tm.has_timer());
        assert!(tm.expired_callbacks().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn overdue_timer_is_drained() {
        let tm = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        tm.add_timer(
            0,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        let cbs = tm.expired_callbacks();
        assert_eq!(cbs.len(), 1);
        for cb in cbs {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!tm.has_timer());
    }

    #[test]
    fn recurring_timer_is_reinserted() {
        let tm = manager();
        let timer = tm.add_timer(0, || {}, true);
        assert_eq!(tm.expired_callbacks().len(), 1);
        assert!(tm.has_timer());
        assert!(timer.cancel());
        assert!(!tm.has_timer());
    }

    #[test]
    fn condition_timer_skips_dropped_condition() {
        let tm = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let cond: Arc<dyn Any + Send + Sync> = Arc::new(42u8);
        tm.add_condition_timer(
            0,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&cond),
            false,
        );
        drop(cond);
        for cb in tm.expired_callbacks() {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn front_insert_wakes_once_until_polled() {
        struct CountWake(AtomicUsize);
        impl Wakeable for CountWake {
            fn wake(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let tm = manager();
        let wake = Arc::new(CountWake(AtomicUsize::new(0)));
        tm.set_waker(Arc::downgrade(&wake) as Weak<dyn Wakeable>);

        // Rapid front insertions with no poll in between: one wake.
        let a = tm.add_timer(5000, || {}, false);
        let b = tm.add_timer(4000, || {}, false);
        let c = tm.add_timer(3000, || {}, false);
        assert_eq!(wake.0.load(Ordering::SeqCst), 1);

        // Cancelling and polling re-arms the latch; the next front insert
        // wakes again.
        c.cancel();
        b.cancel();
        let _ = tm.next_timer_ms();
        let d = tm.add_timer(1000, || {}, false);
        assert_eq!(wake.0.load(Ordering::SeqCst), 2);
        d.cancel();
        a.cancel();
    }

    #[test]
    fn refresh_and_reset_move_the_deadline() {
        let tm = manager();
        let timer = tm.add_timer(50, || {}, false);
        assert!(timer.refresh());
        assert!(timer.reset(10_000, true));
        // far in the future now, nothing expires
        assert!(tm.expired_callbacks().is_empty());
        assert!(timer.cancel());
        assert!(!timer.refresh());
        assert!(!timer.reset(5, true));
    }
}
