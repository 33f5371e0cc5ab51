//! Epoll reactor composed with the scheduler and timer manager.
//!
//! The reactor is the scheduler's `idle()` implementation: workers block
//! in `epoll_wait` sized by the nearest timer deadline (capped), and fd
//! readiness / timer expiry turn into scheduler tasks. Everything is
//! edge-triggered; a registration fires at most once and must be re-armed
//! by its consumer.
//!
//! Cross-thread wakes go through an internal pipe: `tickle()` writes one
//! byte when an idle worker exists, and the reactor drains the pipe fully
//! each time it shows up ready.

mod fd_context;

use std::cell::RefCell;
use std::io;
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;

use crate::fiber::{self, Fiber};
use crate::hook;
use crate::scheduler::{self, Schedule, ScheduleTask, SchedulerShared, WorkerPool};
use crate::timer::{Timer, TimerManager};
use crate::{Error, Result};

pub use fd_context::IoEvent;
pub(crate) use fd_context::FdContext;

/// Upper bound on one epoll_wait batch.
const MAX_EVENTS: usize = 256;
/// Cap on the reactor's wait so a worker rechecks the stop predicate even
/// with no timers armed.
const MAX_TIMEOUT: Duration = Duration::from_millis(5000);
/// Initial fd-context table size.
const INITIAL_FD_SLOTS: usize = 32;

thread_local! {
    static CURRENT_REACTOR: RefCell<Option<Weak<IoShared>>> = RefCell::new(None);
}

/// The reactor reachable from the calling thread, if any. Worker threads
/// publish theirs before dispatching; the constructing thread gets it at
/// construction.
pub(crate) fn current_reactor() -> Option<Arc<IoShared>> {
    CURRENT_REACTOR.with(|slot| slot.borrow().as_ref().and_then(Weak::upgrade))
}

fn set_current_reactor(reactor: Weak<IoShared>) {
    CURRENT_REACTOR.with(|slot| *slot.borrow_mut() = Some(reactor));
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn epoll_ctl(epoll_fd: RawFd, op: libc::c_int, fd: RawFd, events: u32, data: u64) -> io::Result<()> {
    let mut event = libc::epoll_event { events, u64: data };
    cvt(unsafe { libc::epoll_ctl(epoll_fd, op, fd, &mut event) }).map(|_| ())
}

/// Reactor state shared by all workers: the scheduler queue, the timer
/// set, the epoll instance, the wake pipe, and the fd-context table.
pub(crate) struct IoShared {
    /// Self-reference handed to event contexts and timer closures.
    weak_self: Weak<IoShared>,
    sched: SchedulerShared,
    timers: TimerManager,
    epoll_fd: RawFd,
    wake_read: RawFd,
    wake_write: RawFd,
    fd_contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
    /// Count of armed (fd, direction) registrations; the reactor cannot
    /// stop while any remain.
    pending_events: AtomicUsize,
}

impl Schedule for IoShared {
    fn shared(&self) -> &SchedulerShared {
        &self.sched
    }

    /// One byte into the wake pipe, and only when somebody is blocked in
    /// the wait to receive it.
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let byte = [1u8];
        let n = unsafe { libc::write(self.wake_write, byte.as_ptr() as *const c_void, 1) };
        if n < 0 {
            log::warn!("{}: wake pipe write failed: {}", self.sched.name(), io::Error::last_os_error());
        }
    }

    /// The reactor keeps running while any fiber could still be woken.
    fn stopping(&self) -> bool {
        !self.timers.has_timer()
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping()
    }

    fn idle(self: Arc<Self>) {
        self.reactor_loop();
    }

    fn on_worker_start(self: Arc<Self>, _worker_id: usize) {
        set_current_reactor(Arc::downgrade(&self));
        hook::set_enabled(true);
    }
}

impl IoShared {
    fn lookup_fd_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let table = self.fd_contexts.read();
        match table.get(fd as usize) {
            Some(Some(ctx)) => Some(Arc::clone(ctx)),
            _ => None,
        }
    }

    fn ensure_fd_context(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "negative fd");
        if let Some(ctx) = self.lookup_fd_context(fd) {
            return ctx;
        }
        let idx = fd as usize;
        let mut table = self.fd_contexts.write();
        if table.len() <= idx {
            let grown = (idx + idx / 2 + 1).max(INITIAL_FD_SLOTS);
            table.resize_with(grown, || None);
        }
        let slot = &mut table[idx];
        if slot.is_none() {
            *slot = Some(Arc::new(FdContext::new(fd)));
        }
        Arc::clone(slot.as_ref().expect("slot populated above"))
    }

    /// Registers interest in one direction on `fd`. With `cb == None` the
    /// currently running fiber becomes the resumption target; it must be
    /// scheduler-managed. At most one registration per direction.
    pub(crate) fn add_event(
        &self,
        fd: RawFd,
        event: IoEvent,
        cb: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> Result<()> {
        let target_fiber = match cb {
            Some(_) => None,
            None => {
                let fiber = Fiber::current();
                if !fiber.scheduler_managed() {
                    return Err(Error::NotInFiber);
                }
                Some(fiber)
            }
        };

        let ctx = self.ensure_fd_context(fd);
        let mut state = ctx.events.lock();
        if state.registered & event.mask() != 0 {
            return Err(Error::EventExists { fd, event });
        }

        let op = if state.registered != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let mask = libc::EPOLLET as u32 | state.registered | event.mask();
        epoll_ctl(self.epoll_fd, op, fd, mask, fd as u64)?;

        state.registered |= event.mask();
        self.pending_events.fetch_add(1, Ordering::SeqCst);

        let target = state.context_mut(event);
        debug_assert!(target.is_clear(), "event context not reset after last fire");
        if let Some(cb) = cb {
            target.arm_callback(self.weak_self.clone(), cb);
        } else if let Some(fiber) = target_fiber {
            target.arm_fiber(self.weak_self.clone(), fiber);
        }
        Ok(())
    }

    /// Deregisters one direction without firing its target.
    pub(crate) fn del_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let ctx = match self.lookup_fd_context(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut state = ctx.events.lock();
        if state.registered & event.mask() == 0 {
            return false;
        }
        let remaining = state.registered & !event.mask();
        if let Err(err) = self.update_registration(fd, remaining) {
            log::warn!("{}: del_event epoll_ctl failed for fd {fd}: {err}", self.sched.name());
            return false;
        }
        state.registered = remaining;
        state.context_mut(event).clear();
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Deregisters one direction and fires its target immediately, as if
    /// the event had occurred.
    pub(crate) fn cancel_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let ctx = match self.lookup_fd_context(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut state = ctx.events.lock();
        if state.registered & event.mask() == 0 {
            return false;
        }
        let remaining = state.registered & !event.mask();
        if let Err(err) = self.update_registration(fd, remaining) {
            log::warn!("{}: cancel_event epoll_ctl failed for fd {fd}: {err}", self.sched.name());
            return false;
        }
        state.trigger(event);
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Cancels every registration on `fd`, firing each target.
    pub(crate) fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = match self.lookup_fd_context(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut state = ctx.events.lock();
        if state.registered == 0 {
            return false;
        }
        if let Err(err) = self.update_registration(fd, 0) {
            log::warn!("{}: cancel_all epoll_ctl failed for fd {fd}: {err}", self.sched.name());
            return false;
        }
        for event in [IoEvent::Read, IoEvent::Write] {
            if state.registered & event.mask() != 0 {
                state.trigger(event);
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
        }
        debug_assert_eq!(state.registered, 0);
        true
    }

    pub(crate) fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// MOD down to `remaining` directions, or DEL when none are left.
    fn update_registration(&self, fd: RawFd, remaining: u32) -> io::Result<()> {
        let op = if remaining != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mask = if remaining != 0 {
            libc::EPOLLET as u32 | remaining
        } else {
            0
        };
        epoll_ctl(self.epoll_fd, op, fd, mask, fd as u64)
    }

    /// Body of the reactor's idle fiber.
    fn reactor_loop(self: Arc<Self>) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        loop {
            if self.stopping() {
                log::debug!("{}: reactor exiting", self.sched.name());
                break;
            }

            let timeout = self
                .timers
                .next_timeout()
                .map_or(MAX_TIMEOUT, |next| next.min(MAX_TIMEOUT));

            let ready = loop {
                let n = unsafe {
                    libc::epoll_wait(
                        self.epoll_fd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as libc::c_int,
                        timeout.as_millis() as libc::c_int,
                    )
                };
                if n >= 0 {
                    break n as usize;
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                log::error!("{}: epoll_wait failed: {err}", self.sched.name());
                break 0;
            };

            let mut expired = Vec::new();
            self.timers.take_expired(&mut expired);
            if !expired.is_empty() {
                log::trace!("{}: {} timers expired", self.sched.name(), expired.len());
            }
            for cb in expired {
                scheduler::submit(&self, ScheduleTask::callback(move || cb()), None);
            }

            for event in events.iter().take(ready) {
                let fd = event.u64 as RawFd;
                let bits = event.events;
                if fd == self.wake_read {
                    self.drain_wake_pipe();
                    continue;
                }
                self.dispatch_ready(fd, bits);
            }

            // Let the dispatch loop run what was just enqueued before the
            // next wait.
            fiber::yield_now();
        }
    }

    fn dispatch_ready(&self, fd: RawFd, mut bits: u32) {
        let ctx = match self.lookup_fd_context(fd) {
            Some(ctx) => ctx,
            // Registration vanished between the wait and now.
            None => return,
        };
        let mut state = ctx.events.lock();

        if bits & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
            // Errors and hangups are delivered through whichever
            // directions are actually registered.
            bits |= (libc::EPOLLIN as u32 | libc::EPOLLOUT as u32) & state.registered;
        }

        let mut fired = 0u32;
        if bits & IoEvent::Read.mask() != 0 {
            fired |= IoEvent::Read.mask();
        }
        if bits & IoEvent::Write.mask() != 0 {
            fired |= IoEvent::Write.mask();
        }
        fired &= state.registered;
        if fired == 0 {
            return;
        }

        let remaining = state.registered & !fired;
        if let Err(err) = self.update_registration(fd, remaining) {
            log::warn!("{}: deregister after fire failed for fd {fd}: {err}", self.sched.name());
            return;
        }

        for event in [IoEvent::Read, IoEvent::Write] {
            if fired & event.mask() != 0 {
                state.trigger(event);
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe { libc::read(self.wake_read, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for IoShared {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

/// Scheduler + timers + epoll reactor. Workers block on readiness instead
/// of polling, and the hook layer is enabled on every worker thread.
pub struct IoManager {
    pool: WorkerPool<IoShared>,
}

impl IoManager {
    /// Builds the reactor and starts its workers immediately.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<IoManager> {
        let epoll_fd = cvt(unsafe { libc::epoll_create1(0) })?;

        let mut pipe_fds = [0 as RawFd; 2];
        if let Err(err) = cvt(unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK) }) {
            unsafe { libc::close(epoll_fd) };
            return Err(err.into());
        }
        let (wake_read, wake_write) = (pipe_fds[0], pipe_fds[1]);

        if let Err(err) = epoll_ctl(
            epoll_fd,
            libc::EPOLL_CTL_ADD,
            wake_read,
            (libc::EPOLLIN | libc::EPOLLET) as u32,
            wake_read as u64,
        ) {
            unsafe {
                libc::close(epoll_fd);
                libc::close(wake_read);
                libc::close(wake_write);
            }
            return Err(err.into());
        }

        let mut table = Vec::new();
        table.resize_with(INITIAL_FD_SLOTS, || None);

        let shared = Arc::new_cyclic(|weak| IoShared {
            weak_self: weak.clone(),
            sched: SchedulerShared::new(name),
            timers: TimerManager::new(),
            epoll_fd,
            wake_read,
            wake_write,
            fd_contexts: RwLock::new(table),
            pending_events: AtomicUsize::new(0),
        });

        // A timer that becomes the new minimum must interrupt a wait
        // sized for the old minimum.
        let waker = Arc::downgrade(&shared);
        shared.timers.set_front_waker(move || {
            if let Some(shared) = waker.upgrade() {
                shared.tickle();
            }
        });

        set_current_reactor(Arc::downgrade(&shared));

        let manager = IoManager {
            pool: WorkerPool::new(shared, threads, use_caller),
        };
        manager.pool.start();
        Ok(manager)
    }

    pub fn name(&self) -> &str {
        self.pool.sched().shared().name()
    }

    pub fn stop(&self) {
        self.pool.stop();
    }

    /// Submits a task runnable on any worker.
    pub fn schedule(&self, task: impl Into<ScheduleTask>) {
        self.pool.schedule(task.into(), None);
    }

    /// Submits a task pinned to worker `affinity` when given.
    pub fn schedule_to(&self, task: impl Into<ScheduleTask>, affinity: Option<usize>) {
        self.pool.schedule(task.into(), affinity);
    }

    /// Convenience for scheduling a plain callback.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        self.pool.schedule(ScheduleTask::callback(f), None);
    }

    /// Registers the calling fiber for one shot of `event` on `fd`.
    pub fn add_event(&self, fd: RawFd, event: IoEvent) -> Result<()> {
        self.pool.sched().add_event(fd, event, None)
    }

    /// Registers `cb` for one shot of `event` on `fd`.
    pub fn add_event_with(
        &self,
        fd: RawFd,
        event: IoEvent,
        cb: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        self.pool.sched().add_event(fd, event, Some(Box::new(cb)))
    }

    /// Deregisters without firing. Returns false when nothing was
    /// registered.
    pub fn del_event(&self, fd: RawFd, event: IoEvent) -> bool {
        self.pool.sched().del_event(fd, event)
    }

    /// Deregisters and fires the target as if the event occurred.
    pub fn cancel_event(&self, fd: RawFd, event: IoEvent) -> bool {
        self.pool.sched().cancel_event(fd, event)
    }

    /// Cancels every registration on `fd`, firing each target.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.pool.sched().cancel_all(fd)
    }

    pub fn add_timer(&self, ms: u64, cb: impl Fn() + Send + Sync + 'static, recurring: bool) -> Timer {
        self.pool.sched().timers.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.pool.sched().timers.add_condition_timer(ms, cb, cond, recurring)
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        if self.pool.on_root_thread() && !self.pool.sched().shared().stop_requested() {
            self.pool.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fd_table_grows_past_initial_size() {
        let manager = IoManager::new(1, false, "io-grow-test").unwrap();
        let shared = manager.pool.sched();
        let ctx = shared.ensure_fd_context(100);
        assert_eq!(ctx.fd(), 100);
        assert!(shared.fd_contexts.read().len() > 100);
        // Same fd resolves to the same slot.
        assert!(Arc::ptr_eq(&ctx, &shared.ensure_fd_context(100)));
        manager.stop();
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let manager = IoManager::new(1, false, "io-dup-test").unwrap();
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);

        manager.add_event_with(fds[0], IoEvent::Read, || {}).unwrap();
        let err = manager.add_event_with(fds[0], IoEvent::Read, || {}).unwrap_err();
        assert!(matches!(err, Error::EventExists { fd, event: IoEvent::Read } if fd == fds[0]));

        // Clean up the registration so the reactor can stop.
        assert!(manager.del_event(fds[0], IoEvent::Read));
        assert!(!manager.del_event(fds[0], IoEvent::Read));
        manager.stop();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
