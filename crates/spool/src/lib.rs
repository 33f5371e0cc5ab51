//! Stackful cooperative fibers with an epoll reactor.
//!
//! `spool` runs many fibers over a small pool of worker threads. A fiber
//! that would block on I/O parks itself, registers interest with the
//! reactor, and yields its worker to the next task; epoll readiness or a
//! timer wakes it back up. The [`hook`] module wraps the common socket
//! calls with that park/retry protocol, so straight-line blocking-style
//! code multiplexes transparently.
//!
//! The pieces, bottom up:
//!
//! - [`fiber`]: stackful coroutines over `ucontext`, with guard-paged
//!   mmap stacks.
//! - [`Scheduler`]: an N:M work queue of fibers and callbacks with
//!   optional worker affinity.
//! - [`TimerManager`]: one-shot, recurring, and weak-conditioned timers
//!   ordered by deadline.
//! - [`IoManager`]: a scheduler whose idle path is an edge-triggered
//!   epoll loop driving fd events and timers.
//! - [`hook`]: blocking-style `read`/`write`/`connect`/`sleep` wrappers
//!   that suspend the calling fiber instead of the thread.

#[cfg(not(target_os = "linux"))]
compile_error!("spool requires Linux (epoll, ucontext)");

mod error;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod io;
mod scheduler;
pub mod timer;

pub use error::{Error, Result};
pub use fiber::{yield_now, Fiber, FiberState, DEFAULT_STACK_SIZE};
pub use io::{IoEvent, IoManager};
pub use scheduler::{current_worker, ScheduleTask, Scheduler};
pub use timer::{Timer, TimerManager};
