//! Fibers
//!
//! A fiber is a set of instructions executed with cooperative multitasking:
//! it owns a stack, runs until it yields, and is resumed by whichever thread
//! ends up holding it. With this module you can:
//! - create, resume and reset fibers ([Fiber](struct.Fiber.html)),
//! - suspend the running fiber with [yield_ready()](struct.Fiber.html#method.yield_ready)
//!   / [yield_suspended()](struct.Fiber.html#method.yield_suspended).
//!
//! Every thread that touches fibers owns one *thread-main* fiber. It has no
//! stack of its own (it runs on the OS stack) and no closure, and it is the
//! only fiber allowed to switch *into* other fibers. A worker fiber always
//! switches back to the thread-main fiber of the thread it runs on, never
//! directly to a sibling. At any moment exactly one fiber per thread is
//! running; the thread-main fiber is running exactly when no worker fiber is.
//!
//! A fiber may be suspended on one thread and resumed on another. The closure
//! therefore has to be `Send`, and the handle type is `Arc<Fiber>`.
//!
//! Example:
//! ```no_run
//! use fibrio::fiber::Fiber;
//!
//! let fiber = Fiber::new(|| {
//!     println!("before yield");
//!     Fiber::yield_ready();
//!     println!("after yield");
//! });
//! fiber.resume();     // prints "before yield"
//! fiber.resume();     // prints "after yield"
//! ```

use std::cell::{RefCell, UnsafeCell};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::error;
use num_traits::FromPrimitive;

use crate::config;

/// Lifecycle of a fiber.
///
/// `Suspended` covers both "never started" (fresh from
/// [Fiber::new](struct.Fiber.html#method.new)) and "parked at a yield point".
/// `Failed` is `Done` for a fiber whose closure panicked.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, ToPrimitive, FromPrimitive)]
pub enum State {
    Init = 0,
    Ready = 1,
    Running = 2,
    Suspended = 3,
    Done = 4,
    Failed = 5,
}

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static FIBER_COUNT: AtomicI32 = AtomicI32::new(0);

thread_local! {
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

pub struct Fiber {
    id: u64,
    is_thread_main: bool,
    state: AtomicU8,
    /// Held from the moment a thread switches into the fiber until that
    /// thread has regained control and the saved context is known complete.
    /// A second thread that wants to resume the fiber spins on it, which
    /// closes the window where a waiter re-enqueues a fiber whose yield has
    /// not finished saving registers yet.
    in_flight: AtomicBool,
    ctx: UnsafeCell<Context>,
    stack: Mutex<Option<Stack>>,
    stack_size: usize,
    entry: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
    /// Back-reference handed out when the fiber itself must appear in a
    /// thread-local or a waiter record.
    self_ref: Weak<Fiber>,
}

// A fiber moves between threads as a unit: only one thread executes it at a
// time (enforced by the state machine plus `in_flight`), and the raw context
// cell is only touched by that thread. Same reasoning as any stackful fiber
// handle that is handed across a thread pool.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber that will run `f`, with the configured default stack
    /// size. The fiber starts out `Suspended`; nothing runs until
    /// [resume](#method.resume).
    pub fn new<F>(f: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(f, config::get().fiber.stack_size)
    }

    /// Create a fiber with an explicit stack size (rounded up to whole pages,
    /// one extra guard page below).
    pub fn with_stack_size<F>(f: F, stack_size: usize) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_boxed(Box::new(f), stack_size)
    }

    pub(crate) fn from_boxed(
        f: Box<dyn FnOnce() + Send + 'static>,
        stack_size: usize,
    ) -> Arc<Fiber> {
        let stack = Stack::new(stack_size).expect("fiber stack allocation failed");
        let mut ctx = Context::default();
        unsafe { ctx.init_for_entry(stack.top(), fiber_entry) };
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|weak| Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            is_thread_main: false,
            state: AtomicU8::new(State::Suspended as u8),
            in_flight: AtomicBool::new(false),
            ctx: UnsafeCell::new(ctx),
            stack: Mutex::new(Some(stack)),
            stack_size,
            entry: Mutex::new(Some(f)),
            self_ref: weak.clone(),
        })
    }

    fn new_thread_main() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|weak| Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            is_thread_main: true,
            state: AtomicU8::new(State::Running as u8),
            in_flight: AtomicBool::new(false),
            ctx: UnsafeCell::new(Context::default()),
            stack: Mutex::new(None),
            stack_size: 0,
            entry: Mutex::new(None),
            self_ref: weak.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst)).expect("corrupt fiber state")
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_thread_main(&self) -> bool {
        self.is_thread_main
    }

    /// Live fibers in the process, thread-main fibers included.
    pub fn count() -> i32 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    /// The fiber currently executing on this thread, the thread-main fiber
    /// when no worker fiber is in, or `None` before the first fiber use.
    // never inlined: the thread-local slot must be re-resolved every call,
    // a fiber may have migrated threads since the last one
    #[inline(never)]
    pub fn current() -> Option<Arc<Fiber>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// The thread-main fiber of the calling thread, created on first use.
    #[inline(never)]
    pub fn thread_main() -> Arc<Fiber> {
        THREAD_MAIN.with(|m| {
            let mut slot = m.borrow_mut();
            if slot.is_none() {
                let main = Self::new_thread_main();
                *slot = Some(main.clone());
                CURRENT.with(|c| {
                    let mut cur = c.borrow_mut();
                    if cur.is_none() {
                        *cur = Some(main);
                    }
                });
            }
            slot.as_ref().unwrap().clone()
        })
    }

    /// Re-aim a finished fiber at a new closure, reusing its identity.
    ///
    /// Only legal in `Init` or `Done`. The stack (released when the fiber
    /// finished) is reallocated and the execution point is reinitialised at
    /// its base.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(f))
    }

    pub(crate) fn reset_boxed(&self, f: Box<dyn FnOnce() + Send + 'static>) {
        let state = self.state();
        assert!(
            state == State::Init || state == State::Done,
            "reset on fiber {} in state {:?}",
            self.id,
            state
        );
        let mut stack = self.stack.lock().unwrap();
        if stack.is_none() {
            *stack = Some(Stack::new(self.stack_size).expect("fiber stack allocation failed"));
        }
        let top = stack.as_ref().unwrap().top();
        unsafe { (*self.ctx.get()).init_for_entry(top, fiber_entry) };
        *self.entry.lock().unwrap() = Some(f);
        self.set_state(State::Suspended);
    }

    /// Switch from the thread-main fiber into this fiber and run it until its
    /// next yield (or completion). Must be called with the thread-main fiber
    /// active; resuming a `Running`, `Done` or `Failed` fiber is a bug.
    pub fn resume(&self) {
        assert!(!self.is_thread_main, "cannot resume a thread-main fiber");
        let me = self.self_ref.upgrade().expect("fiber handle already gone");
        let main = Fiber::thread_main();
        {
            let current = Fiber::current().expect("thread-main fiber just initialised");
            assert!(
                current.is_thread_main,
                "resume is only legal from the thread-main fiber (fiber {} is active)",
                current.id
            );
        }
        let state = self.state();
        assert!(
            state == State::Suspended || state == State::Ready,
            "resume on fiber {} in state {:?}",
            self.id,
            state
        );

        // Wait out a concurrent switch-away that has not finished saving.
        while self.in_flight.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }

        self.set_state(State::Running);
        main.set_state(State::Suspended);
        CURRENT.with(|c| *c.borrow_mut() = Some(me));

        unsafe { fibrio_switch_context(main.ctx.get(), self.ctx.get()) };

        // The fiber yielded or finished; we are back on the OS stack and its
        // saved context (if any) is complete.
        CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
        main.set_state(State::Running);
        self.in_flight.store(false, Ordering::Release);

        match self.state() {
            State::Done | State::Failed => self.release_stack(),
            _ => {}
        }
    }

    /// Suspend the running fiber and mark it `Ready`: the caller intends to
    /// run it again without waiting for any event (the scheduler re-enqueues
    /// such fibers immediately).
    pub fn yield_ready() {
        Self::switch_out(State::Ready);
    }

    /// Suspend the running fiber and mark it `Suspended`: some waiter (timer,
    /// I/O readiness, application code) holds the handle and will re-enqueue
    /// it later.
    pub fn yield_suspended() {
        Self::switch_out(State::Suspended);
    }

    fn switch_out(state: State) {
        let cur = Fiber::current().expect("yield outside of any fiber");
        assert!(
            !cur.is_thread_main,
            "the thread-main fiber cannot yield"
        );
        let main = Fiber::thread_main();
        cur.set_state(state);
        unsafe { fibrio_switch_context(cur.ctx.get(), main.ctx.get()) };
        // resumed again, running on the fiber stack
    }

    fn release_stack(&self) {
        *self.stack.lock().unwrap() = None;
    }

    fn take_entry(&self) -> Box<dyn FnOnce() + Send + 'static> {
        self.entry
            .lock()
            .unwrap()
            .take()
            .expect("fiber resumed without a closure")
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("thread_main", &self.is_thread_main)
            .finish()
    }
}

/// First frame of every fiber. Runs the closure, records the outcome, and
/// performs one final switch back to the thread-main fiber. Control must
/// never come back here: a finished fiber cannot be resumed.
extern "C" fn fiber_entry() -> ! {
    let (own_ctx, main_ctx) = {
        let fiber = Fiber::current().expect("fiber entry without a current fiber");
        let f = fiber.take_entry();
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => fiber.set_state(State::Done),
            Err(cause) => {
                let what = panic_message(&cause);
                error!("fiber {} failed: {}", fiber.id(), what);
                fiber.set_state(State::Failed);
            }
        }
        // The closure may have suspended and been resumed on a different
        // thread, so the switch-back target is resolved only now.
        let main = Fiber::thread_main();
        // Raw pointers only past this point: anything left on this stack at
        // the final switch is abandoned, so no owning values may survive the
        // scope. The fiber itself is kept alive by the resumer's handle.
        (fiber.ctx.get(), main.ctx.get())
    };
    unsafe { fibrio_switch_context(own_ctx, main_ctx) };
    unreachable!("finished fiber was resumed");
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = cause.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

// ---------------------------------------------------------------------------
// Stacks
// ---------------------------------------------------------------------------

/// An mmap'd fiber stack. Layout, low to high:
///
/// ```text
/// base                     base+page                        base+len
///   +--- guard page ---------+--- usable stack space ----------+
/// ```
///
/// The guard page stays `PROT_NONE` so running off the end faults instead of
/// scribbling over a neighbouring allocation.
struct Stack {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for Stack {}

impl Stack {
    fn new(size: usize) -> io::Result<Stack> {
        let page = page_size();
        let size = (size.max(page) + page - 1) & !(page - 1);
        let len = size + page;
        unsafe {
            let base = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            let usable = (base as *mut u8).add(page);
            if libc::mprotect(
                usable as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                let err = io::Error::last_os_error();
                libc::munmap(base, len);
                return Err(err);
            }
            Ok(Stack {
                base: base as *mut u8,
                len,
            })
        }
    }

    fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
        debug_assert_eq!(rc, 0);
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

// ---------------------------------------------------------------------------
// Machine context
// ---------------------------------------------------------------------------

/// Callee-saved register set. Slot 0 is always the stack pointer; the rest of
/// the layout is fixed per architecture and mirrored by the assembly below.
#[repr(C)]
struct Context {
    #[cfg(target_arch = "x86_64")]
    regs: [u64; 7], // rsp, rbp, rbx, r12, r13, r14, r15
    #[cfg(target_arch = "aarch64")]
    regs: [u64; 21], // sp, x30, x29, x19..x28, d8..d15
}

impl Default for Context {
    fn default() -> Self {
        Context {
            regs: [0; REG_COUNT],
        }
    }
}

#[cfg(target_arch = "x86_64")]
const REG_COUNT: usize = 7;
#[cfg(target_arch = "aarch64")]
const REG_COUNT: usize = 21;

impl Context {
    /// Point a context at a fresh stack so that the first switch into it
    /// lands in `entry`.
    unsafe fn init_for_entry(&mut self, stack_top: *mut u8, entry: extern "C" fn() -> !) {
        self.regs = [0; REG_COUNT];
        let top = (stack_top as usize) & !15;

        #[cfg(target_arch = "x86_64")]
        {
            // The switch routine enters a context with `ret`, so the entry
            // address sits on the stack. The slot is 16-aligned: after the
            // pop the stack pointer is at top-8, which is what the ABI
            // expects at function entry. The extra zeroed slot is a fake
            // return address for `entry` (never used, it cannot return).
            let slot = (top - 16) as *mut u64;
            *slot = entry as usize as u64;
            *((top - 8) as *mut u64) = 0;
            self.regs[0] = slot as u64;
        }

        #[cfg(target_arch = "aarch64")]
        {
            // `ret` jumps through the restored link register.
            self.regs[0] = top as u64;
            self.regs[1] = entry as usize as u64;
        }
    }
}

extern "C" {
    /// Save the callee-saved set of the calling context into `save`, load
    /// `load`, and continue wherever `load` last stopped. Returns when some
    /// later switch restores `save`.
    fn fibrio_switch_context(save: *mut Context, load: *const Context);
}

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    r#"
    .text
    .globl fibrio_switch_context
    .hidden fibrio_switch_context
    .type fibrio_switch_context, @function
    .align 16
fibrio_switch_context:
    mov [rdi + 0x00], rsp
    mov [rdi + 0x08], rbp
    mov [rdi + 0x10], rbx
    mov [rdi + 0x18], r12
    mov [rdi + 0x20], r13
    mov [rdi + 0x28], r14
    mov [rdi + 0x30], r15
    mov rsp, [rsi + 0x00]
    mov rbp, [rsi + 0x08]
    mov rbx, [rsi + 0x10]
    mov r12, [rsi + 0x18]
    mov r13, [rsi + 0x20]
    mov r14, [rsi + 0x28]
    mov r15, [rsi + 0x30]
    ret
    .size fibrio_switch_context, . - fibrio_switch_context
"#
);

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    r#"
    .text
    .globl fibrio_switch_context
    .hidden fibrio_switch_context
    .type fibrio_switch_context, %function
    .align 4
fibrio_switch_context:
    mov x2, sp
    str x2, [x0, #0x00]
    stp x30, x29, [x0, #0x08]
    stp x19, x20, [x0, #0x18]
    stp x21, x22, [x0, #0x28]
    stp x23, x24, [x0, #0x38]
    stp x25, x26, [x0, #0x48]
    stp x27, x28, [x0, #0x58]
    stp d8, d9, [x0, #0x68]
    stp d10, d11, [x0, #0x78]
    stp d12, d13, [x0, #0x88]
    stp d14, d15, [x0, #0x98]
    ldr x2, [x1, #0x00]
    mov sp, x2
    ldp x30, x29, [x1, #0x08]
    ldp x19, x20, [x1, #0x18]
    ldp x21, x22, [x1, #0x28]
    ldp x23, x24, [x1, #0x38]
    ldp x25, x26, [x1, #0x48]
    ldp x27, x28, [x1, #0x58]
    ldp d8, d9, [x1, #0x68]
    ldp d10, d11, [x1, #0x78]
    ldp d12, d13, [x1, #0x88]
    ldp d14, d15, [x1, #0x98]
    ret
"#
);

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("fibers are not supported on this CPU architecture");
