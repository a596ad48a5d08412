//! Process-wide file descriptor metadata.
//!
//! The syscall layer keeps one [FdMeta](struct.FdMeta.html) per descriptor it
//! has observed: whether the fd is a socket, the user-visible and the kernel
//! non-blocking flags, per-direction timeouts, and a closed marker. Entries
//! are created lazily by the first hooked syscall touching the fd and removed
//! by `close`.
//!
//! On creation a socket fd is switched to kernel non-blocking mode (that is
//! what lets the hooks turn `EAGAIN` into a fiber suspension), while the
//! *user* non-blocking flag stays false, so application code keeps seeing a
//! blocking socket.

use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::ioman::WeakIoManager;

/// Which configured timeout applies to an I/O direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// No timeout configured.
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

pub struct FdMeta {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
    /// The I/O scheduler that last armed an event on this fd; lets `close`
    /// cancel waiters even when called from a thread no scheduler drives.
    event_owner: Mutex<Option<WeakIoManager>>,
}

impl FdMeta {
    fn new(fd: RawFd) -> FdMeta {
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        let is_socket = unsafe { libc::fstat(fd, stat.as_mut_ptr()) } == 0
            && unsafe { stat.assume_init() }.st_mode & libc::S_IFMT == libc::S_IFSOCK;

        let sys_nonblock = if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            true
        } else {
            false
        };

        FdMeta {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(TIMEOUT_INFINITE),
            send_timeout_ms: AtomicU64::new(TIMEOUT_INFINITE),
            event_owner: Mutex::new(None),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::SeqCst)
    }

    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::SeqCst);
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Timeout for a direction in ms, [TIMEOUT_INFINITE](constant.TIMEOUT_INFINITE.html)
    /// when unset.
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::SeqCst),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::SeqCst),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::SeqCst),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::SeqCst),
        }
    }

    pub(crate) fn set_event_owner(&self, owner: WeakIoManager) {
        *self.event_owner.lock().unwrap() = Some(owner);
    }

    pub(crate) fn event_owner(&self) -> Option<WeakIoManager> {
        self.event_owner.lock().unwrap().clone()
    }
}

pub struct FdTable {
    fds: RwLock<Vec<Option<Arc<FdMeta>>>>,
}

impl FdTable {
    fn new() -> FdTable {
        FdTable {
            fds: RwLock::new((0..32).map(|_| None).collect()),
        }
    }

    /// Metadata for `fd`. With `auto_create` the entry is created (probing
    /// the fd) when absent; the table grows by 1.5x as needed.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdMeta>> {
        if fd < 0 {
            return None;
        }
        {
            let fds = self.fds.read().unwrap();
            if let Some(Some(meta)) = fds.get(fd as usize) {
                return Some(meta.clone());
            }
            if !auto_create {
                return None;
            }
        }

        let mut fds = self.fds.write().unwrap();
        let needed = fd as usize + 1;
        if fds.len() < needed {
            let target = needed.max(fds.len() * 3 / 2);
            let grow = target - fds.len();
            fds.extend((0..grow).map(|_| None));
        }
        let slot = &mut fds[fd as usize];
        if slot.is_none() {
            *slot = Some(Arc::new(FdMeta::new(fd)));
        }
        slot.clone()
    }

    /// Forget `fd`. The caller is responsible for the actual `close`.
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut fds = self.fds.write().unwrap();
        if let Some(slot) = fds.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

lazy_static! {
    static ref FD_TABLE: FdTable = FdTable::new();
}

/// The process-wide descriptor table.
pub fn table() -> &'static FdTable {
    &FD_TABLE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_socket_fd_is_probed_as_such() {
        // stdin may be anything in the test environment, so make a pipe.
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let meta = table().get(fds[0], true).unwrap();
        assert!(!meta.is_socket());
        assert!(!meta.user_nonblock());
        assert_eq!(meta.timeout(TimeoutKind::Recv), TIMEOUT_INFINITE);
        table().remove(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn socket_fd_is_forced_kernel_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let meta = table().get(fd, true).unwrap();
        assert!(meta.is_socket());
        assert!(meta.sys_nonblock());
        // the kernel flag is set, the user-visible flag is not
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);
        assert!(!meta.user_nonblock());
        table().remove(fd);
        unsafe { libc::close(fd) };
    }
}
