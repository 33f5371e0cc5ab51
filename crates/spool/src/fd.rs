//! Descriptor metadata consumed by the hook layer.
//!
//! The registry tracks every fd the hook layer has seen. Sockets are
//! switched to `O_NONBLOCK` on first sight so hooked calls can use the
//! EAGAIN/park/retry path; the flag the application asked for is kept
//! separately and never touches the real descriptor.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::io::IoEvent;

const NO_TIMEOUT_MS: u64 = u64::MAX;

/// Per-descriptor metadata: socket-ness, non-blocking flags, and
/// per-direction timeouts in milliseconds.
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut stat) } == 0
            && stat.st_mode & libc::S_IFMT == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        FdCtx {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT_MS),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT_MS),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    /// Whether the real descriptor is non-blocking (always true for
    /// sockets the registry has seen).
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    /// The non-blocking mode the application asked for. A true value
    /// makes hooked calls pass EAGAIN straight through.
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    pub fn set_user_nonblock(&self, nonblock: bool) {
        self.user_nonblock.store(nonblock, Ordering::Relaxed);
    }

    pub fn timeout(&self, event: IoEvent) -> Option<Duration> {
        let ms = self.timeout_slot(event).load(Ordering::Relaxed);
        if ms == NO_TIMEOUT_MS {
            None
        } else {
            Some(Duration::from_millis(ms))
        }
    }

    pub fn set_timeout(&self, event: IoEvent, timeout: Option<Duration>) {
        let ms = timeout.map_or(NO_TIMEOUT_MS, |t| t.as_millis() as u64);
        self.timeout_slot(event).store(ms, Ordering::Relaxed);
    }

    fn timeout_slot(&self, event: IoEvent) -> &AtomicU64 {
        match event {
            IoEvent::Read => &self.recv_timeout_ms,
            IoEvent::Write => &self.send_timeout_ms,
        }
    }
}

/// Process-wide fd metadata table. Lookup is the hot path: every hooked
/// call starts here.
pub struct FdRegistry {
    fds: DashMap<RawFd, Arc<FdCtx>>,
}

static REGISTRY: Lazy<FdRegistry> = Lazy::new(|| FdRegistry {
    fds: DashMap::new(),
});

pub fn fd_registry() -> &'static FdRegistry {
    &REGISTRY
}

impl FdRegistry {
    /// Looks up `fd`, creating (and initializing) the entry when
    /// `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        if let Some(ctx) = self.fds.get(&fd) {
            return Some(Arc::clone(&ctx));
        }
        if !auto_create {
            return None;
        }
        let ctx = self
            .fds
            .entry(fd)
            .or_insert_with(|| Arc::new(FdCtx::new(fd)));
        Some(Arc::clone(&ctx))
    }

    /// Forgets `fd`. Called on close; the number may be reused by the OS
    /// immediately afterwards.
    pub fn del(&self, fd: RawFd) {
        self.fds.remove(&fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_forced_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let ctx = fd_registry().get(fd, true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);

        fd_registry().del(fd);
        assert!(fd_registry().get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_pipe_is_not_socket() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let ctx = fd_registry().get(fds[0], true).unwrap();
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());

        fd_registry().del(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_timeouts_per_direction() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let ctx = fd_registry().get(fd, true).unwrap();

        assert_eq!(ctx.timeout(IoEvent::Read), None);
        ctx.set_timeout(IoEvent::Read, Some(Duration::from_millis(50)));
        assert_eq!(ctx.timeout(IoEvent::Read), Some(Duration::from_millis(50)));
        assert_eq!(ctx.timeout(IoEvent::Write), None);
        ctx.set_timeout(IoEvent::Read, None);
        assert_eq!(ctx.timeout(IoEvent::Read), None);

        fd_registry().del(fd);
        unsafe { libc::close(fd) };
    }
}
