//! Socket facade.
//!
//! [Socket](struct.Socket.html) is a thin, POSIX-shaped wrapper over the
//! hooked syscall layer: on an I/O-scheduler worker every potentially
//! blocking call suspends the calling fiber instead of the thread, while the
//! API keeps the familiar blocking look. On an unmanaged thread the same
//! calls behave like ordinary blocking sockets.
//!
//! Address conversion to and from the raw `sockaddr` forms is done by hand on
//! `libc` types; only IPv4 and IPv6 are represented.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::debug;

use crate::config;
use crate::fd;
use crate::hook;
use crate::ioman::{EventKind, IoManager};

pub struct Socket {
    fd: RawFd,
    closed: AtomicBool,
}

impl Socket {
    /// An IPv4 TCP socket with `SO_REUSEADDR` and `TCP_NODELAY` set.
    pub fn tcp() -> io::Result<Socket> {
        let sock = Socket::new(libc::AF_INET, libc::SOCK_STREAM, 0)?;
        sock.init_tcp()?;
        Ok(sock)
    }

    /// An IPv6 TCP socket with `SO_REUSEADDR` and `TCP_NODELAY` set.
    pub fn tcp6() -> io::Result<Socket> {
        let sock = Socket::new(libc::AF_INET6, libc::SOCK_STREAM, 0)?;
        sock.init_tcp()?;
        Ok(sock)
    }

    pub fn udp() -> io::Result<Socket> {
        Socket::new(libc::AF_INET, libc::SOCK_DGRAM, 0)
    }

    pub fn udp6() -> io::Result<Socket> {
        Socket::new(libc::AF_INET6, libc::SOCK_DGRAM, 0)
    }

    pub fn new(domain: i32, ty: i32, protocol: i32) -> io::Result<Socket> {
        let fd = hook::socket(domain, ty, protocol);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Socket {
            fd,
            closed: AtomicBool::new(false),
        })
    }

    /// Adopt an already-open descriptor (an accepted connection).
    fn from_fd(fd: RawFd) -> Socket {
        Socket {
            fd,
            closed: AtomicBool::new(false),
        }
    }

    fn init_tcp(&self) -> io::Result<()> {
        self.set_opt_flag(libc::SOL_SOCKET, libc::SO_REUSEADDR)?;
        self.set_opt_flag(libc::IPPROTO_TCP, libc::TCP_NODELAY)
    }

    fn set_opt_flag(&self, level: i32, optname: i32) -> io::Result<()> {
        let one: libc::c_int = 1;
        let rc = unsafe {
            hook::setsockopt(
                self.fd,
                level,
                optname,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = sockaddr_from(addr);
        let rc = unsafe { libc::bind(self.fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        if unsafe { libc::listen(self.fd, backlog) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accept one connection, suspending the calling fiber until a client
    /// arrives. The accepted socket starts with the configured server read
    /// timeout (`tcp_server.read_time`).
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let client = unsafe {
            hook::accept(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if client < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = Socket::from_fd(client);
        let read_time = config::get().tcp_server.read_time;
        if read_time != 0 {
            sock.set_recv_timeout(Some(Duration::from_millis(read_time)))?;
        }
        let peer = unsafe { sockaddr_to(&storage) }?;
        debug!("accepted fd {} from {}", client, peer);
        Ok((sock, peer))
    }

    /// Connect with the configured default timeout (`tcp.connect.timeout`).
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        self.connect_timeout(addr, config::get().tcp.connect.timeout)
    }

    /// Connect, failing with `ETIMEDOUT` after `timeout_ms`.
    pub fn connect_timeout(&self, addr: &SocketAddr, timeout_ms: u64) -> io::Result<()> {
        let (storage, len) = sockaddr_from(addr);
        let rc = unsafe {
            hook::connect_with_timeout(
                self.fd,
                &storage as *const _ as *const libc::sockaddr,
                len,
                timeout_ms,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        ret_size(hook::recv(self.fd, buf, 0))
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        ret_size(hook::send(self.fd, buf, 0))
    }

    /// Scatter read.
    ///
    /// # Safety
    /// Every `iovec` must describe writable memory of its stated length.
    pub unsafe fn recv_vectored(&self, iov: &[libc::iovec]) -> io::Result<usize> {
        ret_size(hook::readv(self.fd, iov))
    }

    /// Gather write.
    ///
    /// # Safety
    /// Every `iovec` must describe readable memory of its stated length.
    pub unsafe fn send_vectored(&self, iov: &[libc::iovec]) -> io::Result<usize> {
        ret_size(hook::writev(self.fd, iov))
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = unsafe {
            hook::recvfrom(
                self.fd,
                buf,
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        let n = ret_size(n)?;
        let addr = unsafe { sockaddr_to(&storage) }?;
        Ok((n, addr))
    }

    pub fn send_to(&self, buf: &[u8], addr: &SocketAddr) -> io::Result<usize> {
        let (storage, len) = sockaddr_from(addr);
        ret_size(unsafe {
            hook::sendto(
                self.fd,
                buf,
                0,
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        })
    }

    /// Store a receive timeout for hooked reads (and the kernel, for
    /// unmanaged use). `None` clears it.
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_timeout_opt(libc::SO_RCVTIMEO, timeout)
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_timeout_opt(libc::SO_SNDTIMEO, timeout)
    }

    fn set_timeout_opt(&self, optname: i32, timeout: Option<Duration>) -> io::Result<()> {
        let tv = match timeout {
            Some(t) => libc::timeval {
                tv_sec: t.as_secs() as libc::time_t,
                tv_usec: t.subsec_micros() as libc::suseconds_t,
            },
            None => libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        let rc = unsafe {
            hook::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                optname,
                &tv as *const _ as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Resume a fiber parked on reads of this socket; it observes the
    /// cancellation through its own flag.
    pub fn cancel_read(&self) -> bool {
        self.cancel(EventKind::READ)
    }

    /// Resume a fiber parked on writes of this socket.
    pub fn cancel_write(&self) -> bool {
        self.cancel(EventKind::WRITE)
    }

    /// Resume every fiber parked on this socket.
    pub fn cancel_all(&self) -> bool {
        match self.event_owner() {
            Some(iom) => iom.cancel_all(self.fd),
            None => false,
        }
    }

    fn cancel(&self, ev: EventKind) -> bool {
        match self.event_owner() {
            Some(iom) => iom.cancel_event(self.fd, ev),
            None => false,
        }
    }

    fn event_owner(&self) -> Option<IoManager> {
        fd::table()
            .get(self.fd, false)
            .and_then(|meta| meta.event_owner())
            .and_then(|weak| weak.upgrade())
            .or_else(IoManager::current)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { sockaddr_to(&storage) }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getpeername(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { sockaddr_to(&storage) }
    }

    /// Close the socket: every parked waiter is resumed and the descriptor is
    /// forgotten. Idempotent; also run by `Drop`.
    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if hook::close(self.fd) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("fd", &self.fd).finish()
    }
}

fn ret_size(n: isize) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*a.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

unsafe fn sockaddr_to(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = *(storage as *const _ as *const libc::sockaddr_in);
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = *(storage as *const _ as *const libc::sockaddr_in6);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported address family {}", family),
        )),
    }
}
