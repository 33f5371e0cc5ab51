//! Per-descriptor registration state.
//!
//! One `FdContext` per fd slot in the reactor's table, holding a mask of
//! registered directions and one resumption target per direction. Created
//! lazily on first registration and reset, not destroyed, on cancellation,
//! so the slot survives for the next registration on the same fd.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::IoShared;
use crate::fiber::Fiber;
use crate::scheduler::{self, ScheduleTask};

/// A direction of interest on a descriptor. READ and WRITE are fully
/// independent: firing one never consumes or alters the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    Read,
    Write,
}

impl IoEvent {
    pub(crate) fn mask(self) -> u32 {
        match self {
            IoEvent::Read => libc::EPOLLIN as u32,
            IoEvent::Write => libc::EPOLLOUT as u32,
        }
    }
}

type CallbackFn = Box<dyn FnOnce() + Send + 'static>;

/// Resumption target for one direction: either a parked fiber or a
/// callback, plus the reactor it must be scheduled on. The owner is
/// captured at registration time, so registrations made from non-worker
/// threads still wake the right reactor.
pub(crate) struct EventContext {
    owner: Weak<IoShared>,
    fiber: Option<Arc<Fiber>>,
    callback: Option<CallbackFn>,
}

impl EventContext {
    fn new() -> EventContext {
        EventContext {
            owner: Weak::new(),
            fiber: None,
            callback: None,
        }
    }

    pub(crate) fn is_clear(&self) -> bool {
        self.fiber.is_none() && self.callback.is_none()
    }

    pub(crate) fn clear(&mut self) {
        self.owner = Weak::new();
        self.fiber = None;
        self.callback = None;
    }

    pub(crate) fn arm_callback(&mut self, owner: Weak<IoShared>, cb: CallbackFn) {
        self.owner = owner;
        self.callback = Some(cb);
    }

    pub(crate) fn arm_fiber(&mut self, owner: Weak<IoShared>, fiber: Arc<Fiber>) {
        self.owner = owner;
        self.fiber = Some(fiber);
    }
}

/// Lock-protected interior of an [`FdContext`].
pub(crate) struct FdEvents {
    /// Mask of directions currently registered with epoll.
    pub(crate) registered: u32,
    read: EventContext,
    write: EventContext,
}

impl FdEvents {
    pub(crate) fn context_mut(&mut self, event: IoEvent) -> &mut EventContext {
        match event {
            IoEvent::Read => &mut self.read,
            IoEvent::Write => &mut self.write,
        }
    }

    /// Deregisters `event` from the mask and schedules its target on the
    /// owning reactor, leaving the slot clear for the next registration.
    pub(crate) fn trigger(&mut self, event: IoEvent) {
        debug_assert!(self.registered & event.mask() != 0, "trigger on unregistered event");
        self.registered &= !event.mask();
        let ctx = self.context_mut(event);
        let owner = ctx.owner.upgrade();
        let task = if let Some(cb) = ctx.callback.take() {
            Some(ScheduleTask::Callback(cb))
        } else {
            ctx.fiber.take().map(ScheduleTask::Fiber)
        };
        ctx.clear();
        if let (Some(owner), Some(task)) = (owner, task) {
            scheduler::submit(&owner, task, None);
        }
    }
}

pub(crate) struct FdContext {
    fd: RawFd,
    pub(crate) events: Mutex<FdEvents>,
}

impl FdContext {
    pub(crate) fn new(fd: RawFd) -> FdContext {
        FdContext {
            fd,
            events: Mutex::new(FdEvents {
                registered: 0,
                read: EventContext::new(),
                write: EventContext::new(),
            }),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }
}
