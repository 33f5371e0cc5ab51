//! Stackful fibers.
//!
//! A [`Fiber`] is a resumable execution context with its own mmap'd stack.
//! Each OS thread tracks up to three contexts: the fiber currently running,
//! the thread's root context (created lazily on first touch), and the
//! scheduler fiber that dispatch loops run on (defaults to the root).
//!
//! `run_in_scheduler` picks the yield target: fibers owned by a scheduler
//! switch back to the scheduler fiber, free-standing fibers switch back to
//! the thread root.

mod context;
mod stack;

use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::Result;
use context::Context;
use stack::FiberStack;

/// Stack size used when a caller passes `stack_size == 0`.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static ROOT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static SCHEDULER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

/// Lifecycle of a fiber. `Term -> Ready` is only reachable through
/// [`Fiber::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    Ready = 0,
    Running = 1,
    Term = 2,
}

impl FiberState {
    fn from_u8(v: u8) -> FiberState {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            2 => FiberState::Term,
            _ => unreachable!("invalid fiber state {v}"),
        }
    }
}

type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// A single cooperative execution context.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    /// True from just before a resume switches in until that resume
    /// observes the fiber switched back out, i.e. until its context save
    /// has completed. A wake racing the yield must wait on this.
    switching: AtomicBool,
    ctx: UnsafeCell<Context>,
    /// None for root fibers, which run on the thread's own stack.
    stack: Option<FiberStack>,
    entry: Mutex<Option<EntryFn>>,
    run_in_scheduler: bool,
}

// Safety: the state machine admits exactly one resumer at a time (resume
// waits for Ready with the switch-out landed, then flips to Running before
// any switch), so the context cell is only ever touched by the thread
// currently switching into or out of this fiber. The entry closure sits
// behind a mutex.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a fiber ready to run `f` on its own stack. `stack_size == 0`
    /// selects [`DEFAULT_STACK_SIZE`]. Fails if the stack cannot be mapped.
    pub fn new(
        f: impl FnOnce() + Send + 'static,
        stack_size: usize,
        run_in_scheduler: bool,
    ) -> Result<Arc<Fiber>> {
        let size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
        let stack = FiberStack::new(size)?;
        let mut ctx = Context::capture();
        ctx.bind(stack.usable_base(), stack.usable_size(), fiber_entry);
        Ok(Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Ready as u8),
            switching: AtomicBool::new(false),
            ctx: UnsafeCell::new(ctx),
            stack: Some(stack),
            entry: Mutex::new(Some(Box::new(f))),
            run_in_scheduler,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// True when this fiber yields back to the scheduler fiber rather than
    /// the thread root.
    pub(crate) fn scheduler_managed(&self) -> bool {
        self.run_in_scheduler
    }

    /// Switches the calling thread into this fiber. The consumed Arc
    /// stays on the caller's stack for the duration of the switch,
    /// keeping the fiber alive even after its entry wrapper has released
    /// its own reference.
    ///
    /// A wake can arrive while the fiber is still mid-yield on another
    /// thread (interest is registered before the yield lands); in that
    /// case resume spins until the switch-out completes.
    pub fn resume(self: Arc<Fiber>) {
        loop {
            match self.state() {
                FiberState::Ready => {
                    if !self.switching.load(Ordering::Acquire) {
                        break;
                    }
                }
                // Racing the owner's yield; wait for the context save.
                FiberState::Running => {}
                FiberState::Term => panic!("resume on terminated fiber"),
            }
            std::hint::spin_loop();
        }
        let prev = if self.run_in_scheduler {
            scheduler_fiber()
        } else {
            root_fiber()
        };
        assert!(!Arc::ptr_eq(&self, &prev), "fiber cannot resume itself");
        self.set_state(FiberState::Running);
        self.switching.store(true, Ordering::Relaxed);
        let from = unsafe { (*prev.ctx.get()).as_mut_ptr() };
        let to = unsafe { (*self.ctx.get()).as_ptr() };
        set_current(Arc::clone(&self));
        unsafe { context::swap(from, to) };
        // The fiber has switched back out and its registers are saved; a
        // parked wake may take it from here.
        self.switching.store(false, Ordering::Release);
    }

    /// Re-arms a terminated fiber with a new entry, reusing its stack.
    pub fn reset(&self, f: impl FnOnce() + Send + 'static) {
        assert_eq!(self.state(), FiberState::Term, "reset requires a terminated fiber");
        let stack = self.stack.as_ref().expect("root fibers cannot be reset");
        *self.entry.lock() = Some(Box::new(f));
        // Safety: Term means no thread is inside this context.
        let ctx = unsafe { &mut *self.ctx.get() };
        ctx.bind(stack.usable_base(), stack.usable_size(), fiber_entry);
        self.set_state(FiberState::Ready);
    }

    /// Switches away from this fiber to its yield target. Must be called
    /// on the thread currently running the fiber.
    fn switch_out(&self) {
        let from;
        let to;
        {
            let target = if self.run_in_scheduler {
                scheduler_fiber()
            } else {
                root_fiber()
            };
            from = unsafe { (*self.ctx.get()).as_mut_ptr() };
            to = unsafe { (*target.ctx.get()).as_ptr() };
            // The thread-local slots keep `target` alive; holding an Arc
            // across a terminal switch would leak its refcount on this
            // abandoned stack.
            set_current(Arc::clone(&target));
        }
        unsafe { context::swap(from, to) };
    }

    /// The fiber currently running on this thread, creating the thread's
    /// root fiber on first touch.
    pub fn current() -> Arc<Fiber> {
        if let Some(curr) = current_opt() {
            return curr;
        }
        root_fiber()
    }

    pub fn current_id() -> u64 {
        Fiber::current().id()
    }
}

/// Entry wrapper shared by all task fibers. Runs the entry closure, marks
/// the fiber terminated, releases this stack's strong reference, and makes
/// the terminal switch through a raw pointer.
extern "C" fn fiber_entry() {
    let raw: *const Fiber;
    {
        let curr = Fiber::current();
        raw = Arc::as_ptr(&curr);
        let entry = curr.entry.lock().take();
        if let Some(f) = entry {
            f();
        }
        curr.set_state(FiberState::Term);
        // `curr` drops here; the resumer's Arc keeps the fiber alive until
        // the switch below lands on the other side.
    }
    unsafe { (*raw).switch_out() };
    unreachable!("terminated fiber resumed");
}

/// Yields the calling fiber back to its scheduler (or the thread root),
/// leaving it `Ready` for a later resume. No-op outside a task fiber.
pub fn yield_now() {
    let curr = match current_opt() {
        Some(curr) => curr,
        None => return,
    };
    if curr.stack.is_none() {
        // Root context; there is nothing to switch back to.
        return;
    }
    curr.set_state(FiberState::Ready);
    curr.switch_out();
}

fn current_opt() -> Option<Arc<Fiber>> {
    CURRENT.with(|slot| slot.borrow().clone())
}

fn set_current(fiber: Arc<Fiber>) {
    CURRENT.with(|slot| *slot.borrow_mut() = Some(fiber));
}

/// This thread's root fiber, created on first touch. Creation also seeds
/// the current and scheduler slots when they are still empty.
pub(crate) fn root_fiber() -> Arc<Fiber> {
    ROOT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(root) = slot.as_ref() {
            return Arc::clone(root);
        }
        let root = Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Running as u8),
            switching: AtomicBool::new(false),
            ctx: UnsafeCell::new(Context::capture()),
            stack: None,
            entry: Mutex::new(None),
            run_in_scheduler: false,
        });
        *slot = Some(Arc::clone(&root));
        CURRENT.with(|c| {
            let mut c = c.borrow_mut();
            if c.is_none() {
                *c = Some(Arc::clone(&root));
            }
        });
        SCHEDULER.with(|s| {
            let mut s = s.borrow_mut();
            if s.is_none() {
                *s = Some(Arc::clone(&root));
            }
        });
        root
    })
}

/// This thread's scheduler fiber; the root fiber unless a caller-mode
/// scheduler installed its dispatch fiber.
pub(crate) fn scheduler_fiber() -> Arc<Fiber> {
    if let Some(fiber) = SCHEDULER.with(|slot| slot.borrow().clone()) {
        return fiber;
    }
    root_fiber()
}

pub(crate) fn set_scheduler_fiber(fiber: Arc<Fiber>) {
    root_fiber();
    SCHEDULER.with(|slot| *slot.borrow_mut() = Some(fiber));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;

    #[test]
    fn test_fiber_runs_to_term() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let fiber = Fiber::new(move || { h.fetch_add(1, SeqCst); }, 0, false).unwrap();
        assert_eq!(fiber.state(), FiberState::Ready);
        Arc::clone(&fiber).resume();
        assert_eq!(hits.load(SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_fiber_yield_and_resume() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let fiber = Fiber::new(
            move || {
                h.fetch_add(1, SeqCst);
                yield_now();
                h.fetch_add(1, SeqCst);
            },
            0,
            false,
        )
        .unwrap();

        Arc::clone(&fiber).resume();
        assert_eq!(hits.load(SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Ready);

        Arc::clone(&fiber).resume();
        assert_eq!(hits.load(SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let fiber = Fiber::new(move || { h.fetch_add(1, SeqCst); }, 0, false).unwrap();
        Arc::clone(&fiber).resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let h = Arc::clone(&hits);
        fiber.reset(move || { h.fetch_add(10, SeqCst); });
        assert_eq!(fiber.state(), FiberState::Ready);
        Arc::clone(&fiber).resume();
        assert_eq!(hits.load(SeqCst), 11);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_current_id_inside_fiber() {
        let seen = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&seen);
        let fiber = Fiber::new(move || { s.store(Fiber::current_id(), SeqCst); }, 0, false).unwrap();
        let root_id = Fiber::current_id();
        Arc::clone(&fiber).resume();
        assert_eq!(seen.load(SeqCst), fiber.id());
        assert_ne!(seen.load(SeqCst), root_id);
        // Back on the root context.
        assert_eq!(Fiber::current_id(), root_id);
    }

    #[test]
    #[should_panic(expected = "resume on terminated fiber")]
    fn test_resume_after_term_panics() {
        let fiber = Fiber::new(|| {}, 0, false).unwrap();
        Arc::clone(&fiber).resume();
        Arc::clone(&fiber).resume();
    }

    #[test]
    fn test_custom_stack_size() {
        let fiber = Fiber::new(
            || {
                // Burn some stack to prove the mapping is real.
                let buf = [0u8; 16 * 1024];
                assert_eq!(buf[buf.len() - 1], 0);
            },
            64 * 1024,
            false,
        )
        .unwrap();
        Arc::clone(&fiber).resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }
}
