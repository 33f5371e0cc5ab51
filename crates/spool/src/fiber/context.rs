//! Thin wrapper over ucontext(3) for capturing and transferring
//! execution contexts.
//!
//! A failed `getcontext`/`swapcontext` leaves register state undefined, so
//! these paths abort instead of unwinding across foreign stack frames.

use std::os::raw::c_void;

/// A heap-pinned `ucontext_t`. Boxed so the address stays stable while
/// other contexts hold pointers into it across switches.
pub(crate) struct Context {
    inner: Box<libc::ucontext_t>,
}

impl Context {
    /// Captures the calling thread's current context. For root fibers this
    /// is the live context; for task fibers it is just initialization
    /// before `bind`.
    pub(crate) fn capture() -> Context {
        let mut inner: Box<libc::ucontext_t> = Box::new(unsafe { std::mem::zeroed() });
        if unsafe { libc::getcontext(&mut *inner) } != 0 {
            fatal("getcontext failed");
        }
        Context { inner }
    }

    /// Points this context at `entry`, running on the given stack. The
    /// context has no successor link; a fiber that returns from `entry`
    /// without switching away is a bug upstream.
    pub(crate) fn bind(&mut self, stack_base: *mut c_void, stack_size: usize, entry: extern "C" fn()) {
        if unsafe { libc::getcontext(&mut *self.inner) } != 0 {
            fatal("getcontext failed");
        }
        self.inner.uc_link = std::ptr::null_mut();
        self.inner.uc_stack.ss_sp = stack_base;
        self.inner.uc_stack.ss_size = stack_size;
        unsafe {
            libc::makecontext(&mut *self.inner, entry, 0);
        }
    }

    pub(crate) fn as_ptr(&self) -> *const libc::ucontext_t {
        &*self.inner
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::ucontext_t {
        &mut *self.inner
    }
}

/// Saves the current context into `from` and activates `to`. Returns when
/// something later switches back into `from`.
///
/// # Safety
/// Both pointers must reference live, initialized contexts, and `to` must
/// either be a captured live context or bound to an entry on a valid stack.
pub(crate) unsafe fn swap(from: *mut libc::ucontext_t, to: *const libc::ucontext_t) {
    if libc::swapcontext(from, to) != 0 {
        fatal("swapcontext failed");
    }
}

fn fatal(msg: &str) -> ! {
    log::error!("{msg}: {}", std::io::Error::last_os_error());
    std::process::abort();
}
