//! Blocking-style call wrappers over the reactor.
//!
//! Each wrapper keeps the blocking call shape but, when the hook is
//! enabled on the calling thread and the fd is a registered socket in
//! blocking mode, converts EAGAIN into "register interest, park the
//! fiber, retry on wake". Per-direction timeouts become condition timers
//! that cancel the registration and surface `ETIMEDOUT`.
//!
//! There is no link-time symbol interposition on this target; callers use
//! these functions explicitly. Reactor worker threads have the hook
//! enabled before they dispatch anything.

use std::cell::Cell;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::raw::{c_int, c_void};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::fd::fd_registry;
use crate::fiber::{self, Fiber};
use crate::io::{current_reactor, IoEvent};
use crate::scheduler::{self, ScheduleTask};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

/// Whether hooked calls on this thread may park fibers.
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(|flag| flag.get())
}

pub fn set_enabled(enabled: bool) {
    HOOK_ENABLED.with(|flag| flag.set(enabled));
}

const NO_TIMEOUT_MS: u64 = u64::MAX;

/// Process-wide default applied by [`connect`].
static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(NO_TIMEOUT_MS);

pub fn set_default_connect_timeout(timeout: Option<Duration>) {
    let ms = timeout.map_or(NO_TIMEOUT_MS, |t| t.as_millis() as u64);
    CONNECT_TIMEOUT_MS.store(ms, Ordering::Relaxed);
}

/// Set to the errno a timed-out wait should surface. Shared between the
/// parked fiber and its condition timer; the timer only fires while this
/// is still alive.
struct TimeoutFlag {
    cancelled: AtomicI32,
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn cvt(ret: c_int) -> io::Result<c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(n: libc::ssize_t) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn into_io_error(err: crate::Error) -> io::Error {
    match err {
        crate::Error::Io(err) => err,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// Shared wait loop for the read/write-class wrappers.
///
/// Pass-through when the hook is off, the fd is unknown to the registry,
/// it is not a socket, or the application asked for non-blocking mode.
/// Otherwise: retry EINTR inline; on EAGAIN register one-shot interest
/// (current fiber as target), arm the fd's timeout as a condition timer,
/// yield, and either retry on readiness or surface `ETIMEDOUT`.
fn do_io<F>(fd: RawFd, event: IoEvent, mut op: F) -> io::Result<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    if !is_enabled() {
        return cvt_size(op());
    }
    let ctx = match fd_registry().get(fd, false) {
        Some(ctx) => ctx,
        None => return cvt_size(op()),
    };
    if !ctx.is_socket() || ctx.user_nonblock() {
        return cvt_size(op());
    }

    let timeout = ctx.timeout(event);
    let flag = Arc::new(TimeoutFlag {
        cancelled: AtomicI32::new(0),
    });

    loop {
        let mut n = op();
        while n == -1 && errno() == libc::EINTR {
            n = op();
        }
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EAGAIN) {
            return Err(err);
        }

        let reactor = match current_reactor() {
            Some(reactor) => reactor,
            // Nothing to park on; the caller sees WouldBlock.
            None => return Err(err),
        };

        let timer = timeout.map(|t| {
            let winfo = Arc::downgrade(&flag);
            let owner = Arc::downgrade(&reactor);
            reactor.timers().add_condition_timer(
                t.as_millis() as u64,
                move || {
                    let flag = match winfo.upgrade() {
                        Some(flag) => flag,
                        None => return,
                    };
                    if flag.cancelled.swap(libc::ETIMEDOUT, Ordering::SeqCst) != 0 {
                        return;
                    }
                    // Fires the registration so the fiber wakes and sees
                    // the flag.
                    if let Some(reactor) = owner.upgrade() {
                        reactor.cancel_event(fd, event);
                    }
                },
                Arc::downgrade(&flag),
                false,
            )
        });

        match reactor.add_event(fd, event, None) {
            Err(err) => {
                if let Some(timer) = &timer {
                    timer.cancel();
                }
                return Err(into_io_error(err));
            }
            Ok(()) => {
                fiber::yield_now();
                if let Some(timer) = &timer {
                    timer.cancel();
                }
                let cancelled = flag.cancelled.load(Ordering::SeqCst);
                if cancelled != 0 {
                    return Err(io::Error::from_raw_os_error(cancelled));
                }
                // Woken by readiness; retry the call.
            }
        }
    }
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, IoEvent::Read, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len())
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
    do_io(fd, IoEvent::Read, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags)
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, IoEvent::Write, || unsafe {
        libc::write(fd, buf.as_ptr() as *const c_void, buf.len())
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> io::Result<usize> {
    do_io(fd, IoEvent::Write, || unsafe {
        libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags)
    })
}

/// Scatter read. `IoSliceMut` is ABI-compatible with `iovec`.
pub fn readv(fd: RawFd, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
    do_io(fd, IoEvent::Read, || unsafe {
        libc::readv(fd, bufs.as_mut_ptr() as *mut libc::iovec, bufs.len() as c_int)
    })
}

/// Gather write. `IoSlice` is ABI-compatible with `iovec`.
pub fn writev(fd: RawFd, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
    do_io(fd, IoEvent::Write, || unsafe {
        libc::writev(fd, bufs.as_ptr() as *const libc::iovec, bufs.len() as c_int)
    })
}

/// Receives one datagram, returning the byte count and the sender's
/// address when the protocol reports one.
pub fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: c_int,
) -> io::Result<(usize, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = 0 as libc::socklen_t;
    let n = do_io(fd, IoEvent::Read, || {
        // The kernel shrinks `len` to what it wrote; restore it per try.
        len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                flags,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        }
    })?;
    Ok((n, raw_to_socket_addr(&storage, len)))
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: c_int, addr: &SocketAddr) -> io::Result<usize> {
    let (storage, len) = socket_addr_to_raw(addr);
    do_io(fd, IoEvent::Write, || unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            flags,
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    })
}

/// Raw `recvmsg` with the park/retry protocol.
///
/// # Safety
/// `msg` must point to a valid `msghdr` whose iovec and control buffers
/// stay alive and exclusive for the whole call.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: c_int) -> io::Result<usize> {
    do_io(fd, IoEvent::Read, || unsafe { libc::recvmsg(fd, msg, flags) })
}

/// Raw `sendmsg` with the park/retry protocol.
///
/// # Safety
/// `msg` must point to a valid `msghdr` whose iovec and control buffers
/// stay alive for the whole call.
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: c_int) -> io::Result<usize> {
    do_io(fd, IoEvent::Write, || unsafe { libc::sendmsg(fd, msg, flags) })
}

/// Accepts a connection, registering the new fd so later hooked calls on
/// it can park.
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let n = do_io(fd, IoEvent::Read, || unsafe {
        libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) as libc::ssize_t
    })?;
    let new_fd = n as RawFd;
    if is_enabled() {
        fd_registry().get(new_fd, true);
    }
    Ok(new_fd)
}

/// Creates a socket and registers it (which also forces `O_NONBLOCK`).
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> io::Result<RawFd> {
    let fd = cvt(unsafe { libc::socket(domain, ty, protocol) })?;
    if is_enabled() {
        fd_registry().get(fd, true);
    }
    Ok(fd)
}

/// Connects with the process-wide default timeout.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let ms = CONNECT_TIMEOUT_MS.load(Ordering::Relaxed);
    let timeout = if ms == NO_TIMEOUT_MS {
        None
    } else {
        Some(Duration::from_millis(ms))
    };
    connect_with_timeout(fd, addr, timeout)
}

/// Non-blocking connect turned back into a blocking call shape:
/// EINPROGRESS parks the fiber on WRITE readiness, and the socket's
/// `SO_ERROR` reports the real outcome after the wake.
pub fn connect_with_timeout(
    fd: RawFd,
    addr: &SocketAddr,
    timeout: Option<Duration>,
) -> io::Result<()> {
    let (storage, len) = socket_addr_to_raw(addr);
    let raw_connect =
        || unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };

    if !is_enabled() {
        return cvt(raw_connect()).map(|_| ());
    }
    let ctx = match fd_registry().get(fd, true) {
        Some(ctx) => ctx,
        None => return cvt(raw_connect()).map(|_| ()),
    };
    if !ctx.is_socket() || ctx.user_nonblock() {
        return cvt(raw_connect()).map(|_| ());
    }

    let n = raw_connect();
    if n == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(err);
    }

    let reactor = match current_reactor() {
        Some(reactor) => reactor,
        None => return Err(err),
    };

    let flag = Arc::new(TimeoutFlag {
        cancelled: AtomicI32::new(0),
    });
    let timer = timeout.map(|t| {
        let winfo = Arc::downgrade(&flag);
        let owner = Arc::downgrade(&reactor);
        reactor.timers().add_condition_timer(
            t.as_millis() as u64,
            move || {
                let flag = match winfo.upgrade() {
                    Some(flag) => flag,
                    None => return,
                };
                if flag.cancelled.swap(libc::ETIMEDOUT, Ordering::SeqCst) != 0 {
                    return;
                }
                if let Some(reactor) = owner.upgrade() {
                    reactor.cancel_event(fd, IoEvent::Write);
                }
            },
            Arc::downgrade(&flag),
            false,
        )
    });

    match reactor.add_event(fd, IoEvent::Write, None) {
        Ok(()) => {
            fiber::yield_now();
            if let Some(timer) = &timer {
                timer.cancel();
            }
            let cancelled = flag.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                return Err(io::Error::from_raw_os_error(cancelled));
            }
        }
        Err(err) => {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            log::warn!("connect: registering WRITE on fd {fd} failed: {err}");
        }
    }

    let mut error: c_int = 0;
    let mut error_len = mem::size_of::<c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut _ as *mut c_void,
            &mut error_len,
        )
    })?;
    if error == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(error))
    }
}

/// Cancels every pending registration on `fd` (waking its fibers), drops
/// the registry entry, then closes the descriptor.
pub fn close(fd: RawFd) -> io::Result<()> {
    if is_enabled() && fd_registry().get(fd, false).is_some() {
        if let Some(reactor) = current_reactor() {
            reactor.cancel_all(fd);
        }
        fd_registry().del(fd);
    }
    cvt(unsafe { libc::close(fd) }).map(|_| ())
}

/// Parks the calling fiber on a one-shot timer instead of blocking the
/// worker thread. Falls back to `thread::sleep` off-fiber.
pub fn sleep(duration: Duration) {
    sleep_ms(duration.as_millis() as u64);
}

pub fn sleep_ms(ms: u64) {
    if is_enabled() {
        if let Some(reactor) = current_reactor() {
            let fiber = Fiber::current();
            if fiber.scheduler_managed() {
                let owner = Arc::downgrade(&reactor);
                reactor.timers().add_timer(
                    ms,
                    move || {
                        if let Some(reactor) = owner.upgrade() {
                            scheduler::submit(
                                &reactor,
                                ScheduleTask::Fiber(Arc::clone(&fiber)),
                                None,
                            );
                        }
                    },
                    false,
                );
                fiber::yield_now();
                return;
            }
        }
    }
    thread::sleep(Duration::from_millis(ms));
}

/// Records a receive timeout for hooked read-class calls on `fd`.
pub fn set_read_timeout(fd: RawFd, timeout: Option<Duration>) {
    if let Some(ctx) = fd_registry().get(fd, true) {
        ctx.set_timeout(IoEvent::Read, timeout);
    }
}

/// Records a send timeout for hooked write-class calls on `fd`.
pub fn set_write_timeout(fd: RawFd, timeout: Option<Duration>) {
    if let Some(ctx) = fd_registry().get(fd, true) {
        ctx.set_timeout(IoEvent::Write, timeout);
    }
}

/// For registered sockets this records the application's wish and leaves
/// the real descriptor non-blocking; for everything else it toggles the
/// fd flag directly.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    if is_enabled() {
        if let Some(ctx) = fd_registry().get(fd, false) {
            if ctx.is_socket() {
                ctx.set_user_nonblock(nonblocking);
                return Ok(());
            }
        }
    }
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }).map(|_| ())
}

fn raw_to_socket_addr(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    // Octets are already network order.
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_disabled_hook_passes_through() {
        assert!(!is_enabled());
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);

        // Empty pipe: the raw EAGAIN surfaces untouched.
        let mut buf = [0u8; 8];
        let err = read(fds[0], &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let n = unsafe { libc::write(fds[1], b"hi".as_ptr() as *const c_void, 2) };
        assert_eq!(n, 2);
        assert_eq!(read(fds[0], &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_enabled_hook_without_reactor_surfaces_wouldblock() {
        // A registered blocking socket with no reactor on this thread
        // cannot park; the caller still gets WouldBlock.
        set_enabled(true);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut peer = std::net::TcpStream::connect(addr).unwrap();
        let (conn, _) = listener.accept().unwrap();

        use std::os::unix::io::AsRawFd;
        let fd = conn.as_raw_fd();
        fd_registry().get(fd, true).unwrap();

        let mut buf = [0u8; 8];
        let err = read(fd, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        // Data present: the fast path returns it without a reactor.
        peer.write_all(b"ok").unwrap();
        peer.flush().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(read(fd, &mut buf).unwrap(), 2);

        fd_registry().del(fd);
        set_enabled(false);
    }
}
