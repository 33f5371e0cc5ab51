//! mmap-backed fiber stacks.
//!
//! Each stack is a private anonymous mapping with one PROT_NONE guard page
//! at the low end, so an overflow faults instead of silently corrupting
//! whatever the allocator placed below.

use std::io;
use std::os::raw::c_void;
use std::ptr;

use once_cell::sync::Lazy;

static PAGE_SIZE: Lazy<usize> =
    Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });

pub(crate) struct FiberStack {
    base: *mut u8,
    total: usize,
    guard: usize,
}

impl FiberStack {
    /// Maps a stack with at least `size` usable bytes (rounded up to the
    /// page size) plus the guard page.
    pub(crate) fn new(size: usize) -> io::Result<FiberStack> {
        let page = *PAGE_SIZE;
        let usable = (size + page - 1) / page * page;
        let total = usable + page;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(base, total) };
            return Err(err);
        }

        Ok(FiberStack {
            base: base as *mut u8,
            total,
            guard: page,
        })
    }

    /// Lowest usable address, just above the guard page.
    pub(crate) fn usable_base(&self) -> *mut c_void {
        unsafe { self.base.add(self.guard) as *mut c_void }
    }

    pub(crate) fn usable_size(&self) -> usize {
        self.total - self.guard
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut c_void, self.total);
        }
    }
}

// The mapping is owned exclusively by the fiber it backs.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_rounds_up_to_page() {
        let stack = FiberStack::new(1).unwrap();
        assert_eq!(stack.usable_size(), *PAGE_SIZE);
        assert!(!stack.usable_base().is_null());
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = FiberStack::new(64 * 1024).unwrap();
        let top = stack.usable_base() as *mut u8;
        unsafe {
            // Touch both ends of the usable range.
            *top = 0xAA;
            *top.add(stack.usable_size() - 1) = 0xBB;
            assert_eq!(*top, 0xAA);
        }
    }
}
