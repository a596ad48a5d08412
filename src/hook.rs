//! Fiber-suspending syscalls.
//!
//! Every blocking POSIX entry point the runtime understands exists here in
//! two forms: the *real* call (the raw `libc` binding) and the hooked wrapper
//! in this module. When the calling thread has hooking enabled (workers of an
//! [IoManager](../ioman/struct.IoManager.html) enable it automatically) and
//! the fd is a managed socket, a call that would block instead:
//!
//! 1. issues the real syscall on the kernel-nonblocking descriptor,
//! 2. on `EAGAIN` registers interest with the I/O scheduler (plus a
//!    condition timer when the fd carries a timeout),
//! 3. suspends the calling fiber,
//! 4. retries once the waiter is resumed, or fails with `ETIMEDOUT` when the
//!    timer won the race.
//!
//! Calls from threads without hooking, on unmanaged fds, or on fds the user
//! explicitly made non-blocking pass straight through. Errors keep the POSIX
//! shape of `-1` plus `errno`, exactly as the wrapped syscall would return
//! them; nothing is rewrapped.
//!
//! Functions taking raw pointers (`sockaddr`, `iovec`, `msghdr`) are `unsafe`
//! for the usual reasons; the slice-based forms are safe.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::{debug, error};

use crate::config;
use crate::fd::{self, TimeoutKind, TIMEOUT_INFINITE};
use crate::fiber::Fiber;
use crate::ioman::{EventKind, IoManager};

thread_local! {
    static HOOK_ENABLED: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

/// Whether blocking calls on this thread are converted into fiber
/// suspensions.
// never inlined: the thread-local flag must be re-resolved every call, a
// fiber may have migrated threads since the last one
#[inline(never)]
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(|e| e.get())
}

#[inline(never)]
pub fn set_enabled(enabled: bool) {
    HOOK_ENABLED.with(|e| e.set(enabled));
}

pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

pub fn set_errno(value: i32) {
    unsafe { *libc::__errno_location() = value };
}

/// Cancellation flag shared between a waiter and its timeout timer. The
/// timer doubles as the *condition*: once the waiter is done and drops its
/// handle, a late timer fires into nothing.
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

/// Common wait-retry loop for all data-path syscalls.
///
/// `f` performs the real syscall; `ev` is the readiness direction to wait
/// for; `kind` selects which per-fd timeout applies.
fn do_io<F>(fd: RawFd, ev: EventKind, kind: TimeoutKind, name: &str, mut f: F) -> isize
where
    F: FnMut() -> isize,
{
    if !is_enabled() {
        return f();
    }
    let meta = match fd::table().get(fd, false) {
        Some(meta) => meta,
        None => return f(),
    };
    if !meta.is_socket() || meta.user_nonblock() {
        return f();
    }
    if meta.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }

    let timeout = meta.timeout(kind);
    let tinfo = Arc::new(TimerInfo::default());

    loop {
        if meta.is_closed() {
            // closed (and possibly recycled) while we were parked
            set_errno(libc::EBADF);
            return -1;
        }
        let mut n = f();
        while n == -1 && errno() == libc::EINTR {
            n = f();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        let iom = match IoManager::current() {
            Some(iom) => iom,
            None => return n, // hooked thread without an I/O scheduler
        };

        let timer = if timeout != TIMEOUT_INFINITE {
            let winfo = Arc::downgrade(&tinfo);
            let cancel_iom = iom.clone();
            Some(iom.add_condition_timer(
                timeout,
                move || {
                    let t = match winfo.upgrade() {
                        Some(t) => t,
                        None => return,
                    };
                    if t.cancelled.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    t.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    cancel_iom.cancel_event(fd, ev);
                },
                Arc::downgrade(&tinfo) as std::sync::Weak<dyn Any + Send + Sync>,
                false,
            ))
        } else {
            None
        };

        if let Err(e) = iom.add_event(fd, ev) {
            error!("{}: add_event(fd={}, {:?}) failed: {}", name, fd, ev, e);
            if let Some(timer) = timer {
                timer.cancel();
            }
            return -1;
        }

        debug!("<{}> fd {} parked on {:?}", name, fd, ev);
        Fiber::yield_suspended();

        if let Some(timer) = timer {
            timer.cancel();
        }
        let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
        // woken by readiness (or cancel_all); retry the real call
    }
}

/// Park the current fiber for `ms` on the thread's I/O scheduler. False when
/// the call must fall back to the real blocking syscall.
fn suspend_for(ms: u64) -> bool {
    if !is_enabled() {
        return false;
    }
    let iom = match IoManager::current() {
        Some(iom) => iom,
        None => return false,
    };
    let fiber = match Fiber::current() {
        Some(f) if !f.is_thread_main() => f,
        _ => return false,
    };
    let sched = iom.scheduler().clone();
    iom.add_timer(
        ms,
        move || sched.schedule(fiber.clone()),
        false,
    );
    Fiber::yield_suspended();
    true
}

pub fn sleep(seconds: u32) -> u32 {
    if suspend_for(seconds as u64 * 1000) {
        return 0;
    }
    unsafe { libc::sleep(seconds) }
}

pub fn usleep(usec: u32) -> i32 {
    if suspend_for(usec as u64 / 1000) {
        return 0;
    }
    unsafe { libc::usleep(usec) }
}

pub fn nanosleep(req: &libc::timespec, rem: Option<&mut libc::timespec>) -> i32 {
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    if suspend_for(ms) {
        return 0;
    }
    let rem = rem.map(|r| r as *mut libc::timespec).unwrap_or(std::ptr::null_mut());
    unsafe { libc::nanosleep(req, rem) }
}

/// The real `socket`, plus registration of the new fd in the descriptor
/// table (which also flips it to kernel-nonblocking when hooked).
pub fn socket(domain: i32, ty: i32, protocol: i32) -> RawFd {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd < 0 || !is_enabled() {
        return fd;
    }
    fd::table().get(fd, true);
    fd
}

/// `connect` with the configured default timeout
/// (`tcp.connect.timeout`).
///
/// # Safety
/// `addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> i32 {
    connect_with_timeout(fd, addr, addrlen, config::get().tcp.connect.timeout)
}

/// Non-blocking connect bridged onto a WRITE wait; `timeout_ms` of
/// [TIMEOUT_INFINITE](../fd/constant.TIMEOUT_INFINITE.html) waits forever.
///
/// # Safety
/// `addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: u64,
) -> i32 {
    if !is_enabled() {
        return libc::connect(fd, addr, addrlen);
    }
    let meta = match fd::table().get(fd, false) {
        Some(meta) => meta,
        None => return libc::connect(fd, addr, addrlen),
    };
    if !meta.is_socket() || meta.user_nonblock() {
        return libc::connect(fd, addr, addrlen);
    }
    if meta.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }

    let n = libc::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let iom = match IoManager::current() {
        Some(iom) => iom,
        None => return n,
    };
    let tinfo = Arc::new(TimerInfo::default());
    let timer = if timeout_ms != TIMEOUT_INFINITE {
        let winfo = Arc::downgrade(&tinfo);
        let cancel_iom = iom.clone();
        Some(iom.add_condition_timer(
            timeout_ms,
            move || {
                let t = match winfo.upgrade() {
                    Some(t) => t,
                    None => return,
                };
                if t.cancelled.load(Ordering::SeqCst) != 0 {
                    return;
                }
                t.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                cancel_iom.cancel_event(fd, EventKind::WRITE);
            },
            Arc::downgrade(&tinfo) as std::sync::Weak<dyn Any + Send + Sync>,
            false,
        ))
    } else {
        None
    };

    if let Err(e) = iom.add_event(fd, EventKind::WRITE) {
        error!("connect: add_event(fd={}, WRITE) failed: {}", fd, e);
        if let Some(timer) = timer {
            timer.cancel();
        }
        return -1;
    }

    Fiber::yield_suspended();

    if let Some(timer) = timer {
        timer.cancel();
    }
    if tinfo.cancelled.load(Ordering::SeqCst) != 0 {
        set_errno(tinfo.cancelled.load(Ordering::SeqCst));
        return -1;
    }

    // recover the final connect result from the socket error slot
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if err != 0 {
        set_errno(err);
        return -1;
    }
    0
}

/// # Safety
/// `addr`/`addrlen` follow the `accept(2)` contract (both may be null).
pub unsafe fn accept(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> i32 {
    let client = do_io(fd, EventKind::READ, TimeoutKind::Recv, "accept", || {
        libc::accept(fd, addr, addrlen) as isize
    }) as i32;
    if client >= 0 && is_enabled() {
        fd::table().get(client, true);
    }
    client
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    let ptr = buf.as_mut_ptr() as *mut libc::c_void;
    let len = buf.len();
    do_io(fd, EventKind::READ, TimeoutKind::Recv, "read", || unsafe {
        libc::read(fd, ptr, len)
    })
}

/// # Safety
/// Every `iovec` must describe writable memory of its stated length.
pub unsafe fn readv(fd: RawFd, iov: &[libc::iovec]) -> isize {
    let ptr = iov.as_ptr();
    let cnt = iov.len() as libc::c_int;
    do_io(fd, EventKind::READ, TimeoutKind::Recv, "readv", || {
        libc::readv(fd, ptr, cnt)
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> isize {
    let ptr = buf.as_mut_ptr() as *mut libc::c_void;
    let len = buf.len();
    do_io(fd, EventKind::READ, TimeoutKind::Recv, "recv", || unsafe {
        libc::recv(fd, ptr, len, flags)
    })
}

/// # Safety
/// `src_addr`/`addrlen` follow the `recvfrom(2)` contract (both may be null).
pub unsafe fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    let ptr = buf.as_mut_ptr() as *mut libc::c_void;
    let len = buf.len();
    do_io(fd, EventKind::READ, TimeoutKind::Recv, "recvfrom", || {
        libc::recvfrom(fd, ptr, len, flags, src_addr, addrlen)
    })
}

/// # Safety
/// `msg` must be a valid `msghdr` whose buffers are writable.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: i32) -> isize {
    do_io(fd, EventKind::READ, TimeoutKind::Recv, "recvmsg", || {
        libc::recvmsg(fd, msg, flags)
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    let ptr = buf.as_ptr() as *const libc::c_void;
    let len = buf.len();
    do_io(fd, EventKind::WRITE, TimeoutKind::Send, "write", || unsafe {
        libc::write(fd, ptr, len)
    })
}

/// # Safety
/// Every `iovec` must describe readable memory of its stated length.
pub unsafe fn writev(fd: RawFd, iov: &[libc::iovec]) -> isize {
    let ptr = iov.as_ptr();
    let cnt = iov.len() as libc::c_int;
    do_io(fd, EventKind::WRITE, TimeoutKind::Send, "writev", || {
        libc::writev(fd, ptr, cnt)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> isize {
    let ptr = buf.as_ptr() as *const libc::c_void;
    let len = buf.len();
    do_io(fd, EventKind::WRITE, TimeoutKind::Send, "send", || unsafe {
        libc::send(fd, ptr, len, flags)
    })
}

/// # Safety
/// `dest_addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: i32,
    dest_addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    let ptr = buf.as_ptr() as *const libc::c_void;
    let len = buf.len();
    do_io(fd, EventKind::WRITE, TimeoutKind::Send, "sendto", || {
        libc::sendto(fd, ptr, len, flags, dest_addr, addrlen)
    })
}

/// # Safety
/// `msg` must be a valid `msghdr` whose buffers are readable.
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: i32) -> isize {
    do_io(fd, EventKind::WRITE, TimeoutKind::Send, "sendmsg", || {
        libc::sendmsg(fd, msg, flags)
    })
}

/// Close a descriptor: cancel every armed waiter, forget the fd-table entry,
/// then the real `close`.
///
/// Works from any thread. Waiters parked on the fd are resumed exactly once
/// and observe `EBADF` on retry.
pub fn close(fd: RawFd) -> i32 {
    if let Some(meta) = fd::table().get(fd, false) {
        meta.mark_closed();
        let owner = meta
            .event_owner()
            .and_then(|weak| weak.upgrade())
            .or_else(IoManager::current);
        if let Some(iom) = owner {
            iom.cancel_all(fd);
        }
        fd::table().remove(fd);
    }
    unsafe { libc::close(fd) }
}

/// `fcntl` restricted to the integer-argument commands.
///
/// `F_SETFL` keeps the user-requested non-blocking bit in the fd table while
/// always leaving the kernel flag set for managed sockets; `F_GETFL` reports
/// the user-visible view.
pub fn fcntl(fd: RawFd, cmd: i32, arg: i32) -> i32 {
    match cmd {
        libc::F_SETFL => {
            let meta = match fd::table().get(fd, false) {
                Some(m) if m.is_socket() && !m.is_closed() => m,
                _ => return unsafe { libc::fcntl(fd, cmd, arg) },
            };
            meta.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
            let arg = if meta.sys_nonblock() {
                arg | libc::O_NONBLOCK
            } else {
                arg & !libc::O_NONBLOCK
            };
            unsafe { libc::fcntl(fd, cmd, arg) }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            let meta = match fd::table().get(fd, false) {
                Some(m) if m.is_socket() && !m.is_closed() => m,
                _ => return flags,
            };
            if meta.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// # Safety
/// `arg` must match what the `request` expects.
pub unsafe fn ioctl(fd: RawFd, request: libc::c_ulong, arg: *mut libc::c_void) -> i32 {
    if request == libc::FIONBIO {
        if let Some(meta) = fd::table().get(fd, false) {
            if meta.is_socket() && !meta.is_closed() {
                let user_nonblock = *(arg as *const libc::c_int) != 0;
                meta.set_user_nonblock(user_nonblock);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// Plain passthrough; present so the intercept surface is complete.
///
/// # Safety
/// `optval`/`optlen` follow the `getsockopt(2)` contract.
pub unsafe fn getsockopt(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> i32 {
    libc::getsockopt(fd, level, optname, optval, optlen)
}

/// Passthrough that additionally mirrors `SO_RCVTIMEO`/`SO_SNDTIMEO` into the
/// fd table (in ms), where the I/O wait loop reads them.
///
/// # Safety
/// `optval` must point to `optlen` valid bytes of the option's type.
pub unsafe fn setsockopt(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> i32 {
    if is_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(meta) = fd::table().get(fd, false) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let ms = if ms == 0 { TIMEOUT_INFINITE } else { ms };
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            meta.set_timeout(kind, ms);
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}
