//! Cooperative I/O scheduling.
//!
//! An [IoManager](struct.IoManager.html) is a [Scheduler](../scheduler/struct.Scheduler.html)
//! whose idle fibers park in `epoll_wait`, plus a
//! [TimerManager](../timer/struct.TimerManager.html) driving the wait
//! timeout. Fibers (or plain callbacks) register interest in a file
//! descriptor direction with [add_event](struct.IoManager.html#method.add_event);
//! when epoll reports readiness the waiter is pushed back onto the scheduler
//! FIFO and resumed by the next free worker.
//!
//! Registration is edge-triggered and one-shot: a direction is disarmed the
//! moment it is delivered, cancelled, or removed, and every waiter is resumed
//! exactly once.
//!
//! A self-pipe is registered with the epoll set; writing one byte to it is
//! how the scheduler interrupts a worker blocked in `epoll_wait` (new
//! runnable, new front timer, shutdown).

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::{debug, error, info};

use crate::fd;
use crate::fiber::Fiber;
use crate::scheduler::{Driver, Scheduler, Task};
use crate::timer::{Timer, TimerManager, Wakeable};

bitflags! {
    /// Event direction(s) of one file descriptor. The bit values match the
    /// epoll interest bits they arm.
    pub struct EventKind: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

/// One armed direction: where to hand the waiter back, and the waiter itself.
struct Waiter {
    sched: Scheduler,
    task: Task,
}

struct FdRecordState {
    armed: EventKind,
    read: Option<Waiter>,
    write: Option<Waiter>,
}

impl Default for FdRecordState {
    fn default() -> Self {
        FdRecordState {
            armed: EventKind::empty(),
            read: None,
            write: None,
        }
    }
}

impl FdRecordState {
    fn slot(&mut self, ev: EventKind) -> &mut Option<Waiter> {
        match ev {
            EventKind::READ => &mut self.read,
            EventKind::WRITE => &mut self.write,
            _ => panic!("not a single event direction: {:?}", ev),
        }
    }
}

/// Per-fd record. The record mutex protects the armed mask and both waiter
/// slots; the epoll interest mask is only changed under it.
struct FdRecord {
    fd: RawFd,
    state: Mutex<FdRecordState>,
}

pub(crate) struct IoInner {
    sched: Scheduler,
    timers: TimerManager,
    epfd: RawFd,
    pipe_read: RawFd,
    pipe_write: RawFd,
    records: RwLock<Vec<Option<Arc<FdRecord>>>>,
    pending_events: AtomicUsize,
    self_ref: RwLock<Weak<IoInner>>,
}

/// Cheap cloneable handle to an I/O scheduler.
#[derive(Clone)]
pub struct IoManager {
    inner: Arc<IoInner>,
}

/// Weak counterpart of [IoManager], stored where a strong handle would keep
/// the scheduler alive forever (worker thread-locals, fd metadata).
#[derive(Clone)]
pub(crate) struct WeakIoManager(Weak<IoInner>);

impl WeakIoManager {
    pub(crate) fn upgrade(&self) -> Option<IoManager> {
        self.0.upgrade().map(|inner| IoManager { inner })
    }
}

thread_local! {
    static CURRENT_IOM: std::cell::RefCell<Option<WeakIoManager>> =
        std::cell::RefCell::new(None);
}

const EVENTS_PER_WAIT: usize = 64;
const MAX_IDLE_TIMEOUT_MS: u64 = 3000;

impl IoManager {
    /// Create an I/O scheduler with `threads` workers and start it
    /// immediately. With `use_caller` the constructing thread is one of the
    /// workers and must be the thread that later calls
    /// [stop](#method.stop).
    pub fn new(threads: usize, use_caller: bool, name: &str) -> io::Result<IoManager> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut pipe = [0 as RawFd; 2];
        if unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe[0], &mut ev) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
                libc::close(pipe[0]);
                libc::close(pipe[1]);
            }
            return Err(err);
        }

        let sched = Scheduler::new(threads, use_caller, name);
        let inner = Arc::new(IoInner {
            sched: sched.clone(),
            timers: TimerManager::new(),
            epfd,
            pipe_read: pipe[0],
            pipe_write: pipe[1],
            records: RwLock::new(new_record_slots(32)),
            pending_events: AtomicUsize::new(0),
            self_ref: RwLock::new(Weak::new()),
        });
        *inner.self_ref.write().unwrap() = Arc::downgrade(&inner);
        inner
            .timers
            .set_waker(Arc::downgrade(&inner) as Weak<dyn Wakeable>);
        sched.set_driver(Arc::downgrade(&inner) as Weak<dyn Driver>);

        let iom = IoManager { inner };
        if use_caller {
            CURRENT_IOM.with(|c| *c.borrow_mut() = Some(iom.downgrade()));
        }
        sched.start();
        Ok(iom)
    }

    /// The I/O scheduler driving the calling thread, if any.
    // never inlined: the thread-local slot must be re-resolved every call,
    // a fiber may have migrated threads since the last one
    #[inline(never)]
    pub fn current() -> Option<IoManager> {
        CURRENT_IOM.with(|c| c.borrow().as_ref().and_then(WeakIoManager::upgrade))
    }

    pub(crate) fn downgrade(&self) -> WeakIoManager {
        WeakIoManager(Arc::downgrade(&self.inner))
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.sched
    }

    /// Enqueue a runnable on this scheduler.
    pub fn schedule<T: Into<Task>>(&self, task: T) {
        self.inner.sched.schedule(task);
    }

    /// Armed (fd, direction) pairs not yet delivered or cancelled.
    pub fn pending_event_count(&self) -> usize {
        self.inner.pending_events.load(Ordering::SeqCst)
    }

    /// Arm a timer `ms` from now; the callback is scheduled onto this
    /// scheduler's workers when it fires.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.timers.add_timer(ms, cb, recurring)
    }

    /// Arm a timer whose callback is skipped if `cond` is gone when it fires.
    pub fn add_condition_timer<F>(
        &self,
        ms: u64,
        cb: F,
        cond: Weak<dyn std::any::Any + Send + Sync>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    pub fn has_timer(&self) -> bool {
        self.inner.timers.has_timer()
    }

    /// Arm one direction of `fd`, parking the current fiber as the waiter.
    /// The fiber must yield with
    /// [yield_suspended](../fiber/struct.Fiber.html#method.yield_suspended)
    /// right after; it is re-enqueued on readiness, cancellation or timeout.
    pub fn add_event(&self, fd: RawFd, ev: EventKind) -> io::Result<()> {
        self.add_event_inner(fd, ev, None)
    }

    /// Arm one direction of `fd` with an explicit callback waiter.
    pub fn add_event_with<F>(&self, fd: RawFd, ev: EventKind, cb: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_event_inner(fd, ev, Some(Box::new(cb)))
    }

    fn add_event_inner(
        &self,
        fd: RawFd,
        ev: EventKind,
        cb: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> io::Result<()> {
        assert!(
            ev == EventKind::READ || ev == EventKind::WRITE,
            "exactly one direction per registration: {:?}",
            ev
        );
        let record = self.record(fd);
        let mut state = record.state.lock().unwrap();
        assert!(
            !state.armed.contains(ev),
            "direction {:?} of fd {} is already armed",
            ev,
            fd
        );

        let old = state.armed;
        let op = if old.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.epoll_update(op, fd, old | ev)?;

        self.inner.pending_events.fetch_add(1, Ordering::SeqCst);
        state.armed = old | ev;
        let task = match cb {
            Some(f) => Task::Call(f),
            None => {
                let fiber = Fiber::current()
                    .expect("add_event without a callback outside of any fiber");
                assert!(
                    !fiber.is_thread_main(),
                    "the thread-main fiber cannot wait for I/O"
                );
                Task::Fiber(fiber)
            }
        };
        *state.slot(ev) = Some(Waiter {
            sched: self.inner.sched.clone(),
            task,
        });

        // Remember who armed the fd so close() from a foreign thread can
        // find us.
        if let Some(meta) = fd::table().get(fd, false) {
            meta.set_event_owner(self.downgrade());
        }
        Ok(())
    }

    /// Disarm one direction and discard its waiter. Returns false when the
    /// direction was not armed.
    pub fn del_event(&self, fd: RawFd, ev: EventKind) -> bool {
        self.remove_event(fd, ev, false)
    }

    /// Disarm one direction and resume its waiter (which will observe
    /// whatever cancellation flag the caller has set). Returns false when the
    /// direction was not armed.
    pub fn cancel_event(&self, fd: RawFd, ev: EventKind) -> bool {
        self.remove_event(fd, ev, true)
    }

    fn remove_event(&self, fd: RawFd, ev: EventKind, fire: bool) -> bool {
        let record = match self.lookup(fd) {
            Some(r) => r,
            None => return false,
        };
        let mut state = record.state.lock().unwrap();
        if !state.armed.contains(ev) {
            return false;
        }
        let left = state.armed - ev;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self.epoll_update(op, fd, left).is_err() {
            return false;
        }
        state.armed = left;
        if fire {
            Self::trigger(&mut state, ev);
        } else {
            *state.slot(ev) = None;
        }
        self.inner.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Drop the whole fd from the epoll set, resuming every armed waiter.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let record = match self.lookup(fd) {
            Some(r) => r,
            None => return false,
        };
        let mut state = record.state.lock().unwrap();
        let armed = state.armed;
        if armed.is_empty() {
            return false;
        }
        let rc = unsafe { libc::epoll_ctl(self.inner.epfd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if rc != 0 {
            error!(
                "epoll_ctl(DEL, fd={}) failed: {}",
                fd,
                io::Error::last_os_error()
            );
            return false;
        }
        if armed.contains(EventKind::READ) {
            Self::trigger(&mut state, EventKind::READ);
            self.inner.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        if armed.contains(EventKind::WRITE) {
            Self::trigger(&mut state, EventKind::WRITE);
            self.inner.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        state.armed = EventKind::empty();
        true
    }

    /// Request shutdown and wait for all workers to drain. See
    /// [Scheduler::stop](../scheduler/struct.Scheduler.html#method.stop) for
    /// the caller-participation rules.
    pub fn stop(&self) {
        self.inner.sched.stop();
    }

    fn epoll_update(&self, op: libc::c_int, fd: RawFd, mask: EventKind) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: mask.bits() | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.inner.epfd, op, fd, &mut ev) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            let events = ev.events;
            error!(
                "epoll_ctl({}, fd={}, events={:#x}) failed: {}",
                op,
                fd,
                events,
                err
            );
            return Err(err);
        }
        Ok(())
    }

    /// Hand the waiter of one direction back to its scheduler. The record
    /// lock must be held; the armed bit must already be cleared.
    fn trigger(state: &mut FdRecordState, ev: EventKind) {
        if let Some(waiter) = state.slot(ev).take() {
            waiter.sched.schedule(waiter.task);
        }
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdRecord>> {
        let records = self.inner.records.read().unwrap();
        records.get(fd as usize).and_then(|slot| slot.clone())
    }

    /// Record for `fd`, growing the table by 1.5x when the fd is past the
    /// end.
    fn record(&self, fd: RawFd) -> Arc<FdRecord> {
        assert!(fd >= 0, "negative fd");
        if let Some(record) = self.lookup(fd) {
            return record;
        }
        let mut records = self.inner.records.write().unwrap();
        let needed = fd as usize + 1;
        if records.len() < needed {
            let target = needed.max(records.len() * 3 / 2);
            let grow = target - records.len();
            records.extend(new_record_slots(grow));
        }
        records[fd as usize]
            .get_or_insert_with(|| {
                Arc::new(FdRecord {
                    fd,
                    state: Mutex::new(FdRecordState::default()),
                })
            })
            .clone()
    }

    fn drain_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.inner.pipe_read,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Body of each worker's idle fiber: wait for readiness or the next
    /// deadline, dispatch, yield back to the worker loop, repeat.
    fn idle_loop(&self) {
        let mut events = vec![
            libc::epoll_event { events: 0, u64: 0 };
            EVENTS_PER_WAIT
        ];
        loop {
            let next = self.inner.timers.next_timer_ms();
            if next == u64::MAX
                && self.pending_event_count() == 0
                && self.inner.sched.stopping_now()
            {
                info!("io scheduler {} idle exits", self.inner.sched.name());
                break;
            }

            let timeout = next.min(MAX_IDLE_TIMEOUT_MS) as libc::c_int;
            let n = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        self.inner.epfd,
                        events.as_mut_ptr(),
                        EVENTS_PER_WAIT as libc::c_int,
                        timeout,
                    )
                };
                if rc < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                break rc;
            };
            if n < 0 {
                error!("epoll_wait failed: {}", io::Error::last_os_error());
            }

            let expired = self.inner.timers.expired_callbacks();
            if !expired.is_empty() {
                debug!("{} timers expired", expired.len());
                self.inner.sched.schedule_batch(
                    expired
                        .into_iter()
                        .map(|cb| Task::call(move || cb())),
                );
            }

            for ev in events.iter().take(n.max(0) as usize) {
                let data = ev.u64;
                if data == self.inner.pipe_read as u64 {
                    self.drain_pipe();
                    continue;
                }
                let fd = data as RawFd;
                let record = match self.lookup(fd) {
                    Some(r) => r,
                    None => continue,
                };
                let mut state = record.state.lock().unwrap();

                let mut bits = ev.events;
                if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    bits |= (libc::EPOLLIN | libc::EPOLLOUT) as u32;
                }
                let ready = EventKind::from_bits_truncate(bits) & state.armed;
                if ready.is_empty() {
                    continue;
                }

                let left = state.armed - ready;
                let op = if left.is_empty() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                if self.epoll_update(op, record.fd, left).is_err() {
                    continue;
                }
                state.armed = left;
                if ready.contains(EventKind::READ) {
                    Self::trigger(&mut state, EventKind::READ);
                    self.inner.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
                if ready.contains(EventKind::WRITE) {
                    Self::trigger(&mut state, EventKind::WRITE);
                    self.inner.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Freshly scheduled work is picked up by the worker loop.
            Fiber::yield_suspended();
        }
    }
}

fn new_record_slots(n: usize) -> Vec<Option<Arc<FdRecord>>> {
    (0..n).map(|_| None).collect()
}

impl Wakeable for IoInner {
    fn wake(&self) {
        self.tickle_one();
    }
}

impl IoInner {
    /// Wake one worker parked in `epoll_wait` by writing a byte to the
    /// self-pipe. Skipped when nobody is idle.
    fn tickle_one(&self) {
        if !self.sched.has_idle_workers() {
            return;
        }
        let byte = b"T";
        let rc = unsafe {
            libc::write(self.pipe_write, byte.as_ptr() as *const libc::c_void, 1)
        };
        if rc != 1 {
            // Pipe full means a wake is already pending; anything else is a
            // real failure.
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                error!("self-pipe write failed: {}", err);
            }
        }
    }

    fn as_manager(&self) -> Option<IoManager> {
        self.self_ref.read().unwrap().upgrade().map(|inner| IoManager { inner })
    }
}

impl Driver for IoInner {
    fn tickle(&self) {
        self.tickle_one();
    }

    fn stopping(&self) -> bool {
        self.sched_stopping()
    }

    fn idle(&self) {
        if let Some(iom) = self.as_manager() {
            iom.idle_loop();
        }
    }

    fn on_thread_start(self: Arc<Self>) {
        let weak = WeakIoManager(Arc::downgrade(&self));
        CURRENT_IOM.with(|c| *c.borrow_mut() = Some(weak));
        crate::hook::set_enabled(true);
    }

    fn on_thread_stop(&self) {
        CURRENT_IOM.with(|c| *c.borrow_mut() = None);
    }
}

impl IoInner {
    fn sched_stopping(&self) -> bool {
        self.pending_events.load(Ordering::SeqCst) == 0
            && !self.timers.has_timer()
            && self.sched.stopping_now()
    }
}

impl Drop for IoInner {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.pipe_read);
            libc::close(self.pipe_write);
        }
    }
}
