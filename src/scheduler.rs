//! Fiber scheduler.
//!
//! A [Scheduler](struct.Scheduler.html) owns a pool of worker threads that
//! consume a single FIFO of runnables. A runnable is either a fiber handle or
//! a plain closure, optionally pinned to one worker. Closures are executed
//! inside a cached *carrier* fiber so that everything that runs on a worker
//! can suspend.
//!
//! The scheduler itself never blocks in the kernel: when a worker finds the
//! queue empty it switches into its *idle fiber*, whose behaviour is supplied
//! by the installed [Driver](trait.Driver.html). The base driver just yields
//! in a loop; the I/O scheduler parks the worker in `epoll_wait` instead.
//!
//! Ordering: enqueue order is preserved only within one enqueue call; across
//! threads nothing is guaranteed. A runnable pinned to a worker is seen by
//! that worker in pinned-FIFO order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;

use log::{debug, info};

use crate::fiber::{Fiber, State};
use crate::hook;

/// A unit of work for a worker: a fiber to resume or a closure to run in a
/// carrier fiber.
pub enum Task {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send + 'static>),
}

impl Task {
    pub fn call<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Call(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

struct Runnable {
    task: Task,
    pinned: Option<usize>,
}

/// The variable part of a scheduler: how workers are woken, when they are
/// allowed to shut down, and what they do when idle.
pub(crate) trait Driver: Send + Sync {
    /// Wake one idle worker. The base scheduler has nothing to wake (idle
    /// workers spin through their idle fiber), so this is a no-op there.
    fn tickle(&self);

    /// True once the scheduler may shut down: stop was requested and no work
    /// remains anywhere.
    fn stopping(&self) -> bool;

    /// Body of the idle fiber; returns when `stopping()` turns true.
    fn idle(&self);

    /// Per-worker-thread setup (thread-locals, syscall hooking).
    fn on_thread_start(self: Arc<Self>) {}

    /// Per-worker-thread teardown.
    fn on_thread_stop(&self) {}
}

/// Fallback driver used while no I/O scheduler is attached.
struct BaseDriver {
    sched: Weak<SchedulerInner>,
}

impl Driver for BaseDriver {
    fn tickle(&self) {}

    fn stopping(&self) -> bool {
        match self.sched.upgrade() {
            Some(inner) => inner.base_stopping(),
            None => true,
        }
    }

    fn idle(&self) {
        while !self.stopping() {
            Fiber::yield_suspended();
        }
    }
}

pub(crate) struct SchedulerInner {
    name: String,
    queue: Mutex<VecDeque<Runnable>>,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    stop_requested: AtomicBool,
    started: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// OS threads spawned by `start` (the caller, if participating, is not
    /// counted here).
    worker_threads: usize,
    use_caller: bool,
    driver: RwLock<Weak<dyn Driver>>,
    /// Keeps the fallback driver alive until an I/O driver replaces it.
    base_driver: Mutex<Option<Arc<dyn Driver>>>,
}

impl SchedulerInner {
    pub(crate) fn base_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
            && self.queue.lock().unwrap().is_empty()
            && self.active_count.load(Ordering::SeqCst) == 0
    }
}

/// Cheap cloneable handle to a scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

thread_local! {
    static CURRENT_SCHED: std::cell::RefCell<Option<Scheduler>> = std::cell::RefCell::new(None);
    static CURRENT_WORKER: std::cell::Cell<Option<usize>> = std::cell::Cell::new(None);
}

impl Scheduler {
    /// Create a scheduler with `threads` workers in total.
    ///
    /// With `use_caller` the constructing thread is one of them: only
    /// `threads - 1` OS threads are spawned, and the caller does its share of
    /// the work inside [stop](#method.stop), which it is then required to be
    /// the one to call.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        assert!(threads >= 1, "a scheduler needs at least one thread");
        let worker_threads = if use_caller { threads - 1 } else { threads };
        let inner = Arc::new(SchedulerInner {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            active_count: AtomicUsize::new(0),
            idle_count: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            worker_threads,
            use_caller,
            driver: RwLock::new(Weak::<BaseDriver>::new()),
            base_driver: Mutex::new(None),
        });
        let base: Arc<dyn Driver> = Arc::new(BaseDriver {
            sched: Arc::downgrade(&inner),
        });
        *inner.driver.write().unwrap() = Arc::downgrade(&base);
        *inner.base_driver.lock().unwrap() = Some(base);
        let sched = Scheduler {
            inner,
        };
        if use_caller {
            // The caller thread belongs to this scheduler from now on.
            CURRENT_SCHED.with(|s| *s.borrow_mut() = Some(sched.clone()));
        }
        sched
    }

    /// The scheduler driving the calling thread, if any.
    // never inlined: the thread-local slot must be re-resolved every call,
    // a fiber may have migrated threads since the last one
    #[inline(never)]
    pub fn current() -> Option<Scheduler> {
        CURRENT_SCHED.with(|s| s.borrow().clone())
    }

    /// The id of the worker running the calling thread, if any.
    #[inline(never)]
    pub fn current_worker() -> Option<usize> {
        CURRENT_WORKER.with(|w| w.get())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Total workers, the participating caller included.
    pub fn worker_count(&self) -> usize {
        self.inner.worker_threads + self.inner.use_caller as usize
    }

    /// The worker id the participating caller runs under.
    pub fn caller_worker_id(&self) -> Option<usize> {
        if self.inner.use_caller {
            Some(self.inner.worker_threads)
        } else {
            None
        }
    }

    pub(crate) fn same_as(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn set_driver(&self, driver: Weak<dyn Driver>) {
        *self.inner.driver.write().unwrap() = driver;
        *self.inner.base_driver.lock().unwrap() = None;
    }

    fn driver(&self) -> Option<Arc<dyn Driver>> {
        self.inner.driver.read().unwrap().upgrade()
    }

    pub(crate) fn has_idle_workers(&self) -> bool {
        self.inner.idle_count.load(Ordering::SeqCst) > 0
    }

    /// The gated shutdown predicate: stop was requested, the queue is
    /// drained, and no worker is mid-task.
    pub(crate) fn stopping_now(&self) -> bool {
        self.inner.base_stopping()
    }

    /// Launch the worker threads. Idempotent while running.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("scheduler {} starting {} threads", self.inner.name, self.inner.worker_threads);
        let mut threads = self.inner.threads.lock().unwrap();
        for i in 0..self.inner.worker_threads {
            let inner = self.inner.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}_{}", self.inner.name, i))
                .spawn(move || worker_main(inner, i))
                .expect("failed to spawn scheduler worker");
            threads.push(handle);
        }
    }

    /// Enqueue a runnable on any worker.
    pub fn schedule<T: Into<Task>>(&self, task: T) {
        self.schedule_on(task, None);
    }

    /// Enqueue a runnable pinned to one worker id.
    pub fn schedule_on<T: Into<Task>>(&self, task: T, worker: Option<usize>) {
        let need_tickle = {
            let mut queue = self.inner.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.push_back(Runnable {
                task: task.into(),
                pinned: worker,
            });
            was_empty
        };
        if need_tickle {
            if let Some(driver) = self.driver() {
                driver.tickle();
            }
        }
    }

    /// Enqueue a batch under a single lock acquisition.
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let need_tickle = {
            let mut queue = self.inner.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            for task in tasks {
                queue.push_back(Runnable { task, pinned: None });
            }
            was_empty && !queue.is_empty()
        };
        if need_tickle {
            if let Some(driver) = self.driver() {
                driver.tickle();
            }
        }
    }

    /// Request shutdown and wait for it.
    ///
    /// Tickles every worker (plus one for the participating caller), then,
    /// if the caller participates, runs the worker loop on the calling
    /// thread until all work has drained, and finally joins the worker
    /// threads. Calling `stop` from inside one of this scheduler's own fibers
    /// only latches the request; the outer `stop` owns the join.
    pub fn stop(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        let driver = self.driver();
        if let Some(ref driver) = driver {
            for _ in 0..self.inner.worker_threads {
                driver.tickle();
            }
            if self.inner.use_caller {
                driver.tickle();
            }
        }

        // Re-entrant stop from a fiber this scheduler is running.
        let on_own_fiber = Scheduler::current()
            .map(|cur| cur.same_as(self))
            .unwrap_or(false)
            && Fiber::current().map(|f| !f.is_thread_main()).unwrap_or(false);
        if on_own_fiber {
            return;
        }

        if self.inner.use_caller {
            let caller_id = self.inner.worker_threads;
            if !self
                .driver()
                .map(|d| d.stopping())
                .unwrap_or(true)
            {
                worker_main(self.inner.clone(), caller_id);
            }
            CURRENT_SCHED.with(|s| *s.borrow_mut() = None);
        }

        let threads: Vec<JoinHandle<()>> = self.inner.threads.lock().unwrap().drain(..).collect();
        for t in threads {
            let _ = t.join();
        }
        info!("scheduler {} stopped", self.inner.name);
    }
}

/// The per-worker loop: pick runnables this worker may execute, resume them,
/// and fall back to the idle fiber when the queue has nothing for us. Exits
/// when the idle fiber completes, which only happens once the driver reports
/// `stopping()`.
fn worker_main(inner: Arc<SchedulerInner>, worker_id: usize) {
    let sched = Scheduler {
        inner: inner.clone(),
    };
    CURRENT_SCHED.with(|s| *s.borrow_mut() = Some(sched.clone()));
    CURRENT_WORKER.with(|w| w.set(Some(worker_id)));
    Fiber::thread_main();

    let driver = match sched.driver() {
        Some(d) => d,
        None => return,
    };
    driver.clone().on_thread_start();

    let idle_driver = driver.clone();
    let idle_fiber = Fiber::new(move || idle_driver.idle());
    let mut carrier: Option<Arc<Fiber>> = None;

    debug!("worker {}:{} running", inner.name, worker_id);
    loop {
        let mut tickle_other = false;
        let mut picked: Option<Task> = None;
        {
            let mut queue = inner.queue.lock().unwrap();
            let mut i = 0;
            while i < queue.len() {
                match queue[i].pinned {
                    Some(w) if w != worker_id => {
                        tickle_other = true;
                        i += 1;
                        continue;
                    }
                    _ => {}
                }
                if let Task::Fiber(ref fiber) = queue[i].task {
                    if fiber.state() == State::Running {
                        // Mid-switch on another worker; it will be suspended
                        // in a moment. Look again after a wake.
                        tickle_other = true;
                        i += 1;
                        continue;
                    }
                }
                picked = Some(queue.remove(i).unwrap().task);
                inner.active_count.fetch_add(1, Ordering::SeqCst);
                break;
            }
        }

        if tickle_other {
            driver.tickle();
        }

        match picked {
            Some(Task::Fiber(fiber)) => {
                if !matches!(fiber.state(), State::Done | State::Failed) {
                    fiber.resume();
                    if fiber.state() == State::Ready {
                        sched.schedule(fiber);
                    }
                    // Suspended: some waiter holds the handle and will
                    // re-enqueue it. Done/Failed: nothing left to do.
                }
                inner.active_count.fetch_sub(1, Ordering::SeqCst);
            }
            Some(Task::Call(f)) => {
                let fiber = match carrier.take() {
                    Some(c) if c.state() == State::Done => {
                        c.reset_boxed(f);
                        c
                    }
                    _ => Fiber::from_boxed(f, crate::config::get().fiber.stack_size),
                };
                fiber.resume();
                match fiber.state() {
                    State::Ready => sched.schedule(fiber),
                    State::Done => carrier = Some(fiber),
                    _ => {} // Suspended (a waiter owns it now) or Failed
                }
                inner.active_count.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                if idle_fiber.state() == State::Done {
                    debug!("worker {}:{} idle fiber done", inner.name, worker_id);
                    break;
                }
                inner.idle_count.fetch_add(1, Ordering::SeqCst);
                idle_fiber.resume();
                inner.idle_count.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    driver.on_thread_stop();
    hook::set_enabled(false);
    CURRENT_WORKER.with(|w| w.set(None));
    CURRENT_SCHED.with(|s| *s.borrow_mut() = None);
}
