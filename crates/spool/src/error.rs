//! Crate-wide error type.

use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::io::IoEvent;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Underlying syscall failure (epoll, mmap, pipe, socket ops).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The fd already has a registration for this direction.
    #[error("{event:?} interest already registered for fd {fd}")]
    EventExists { fd: RawFd, event: IoEvent },

    /// The operation needs a scheduler-managed fiber as its resumption
    /// target, but the caller is not running inside one.
    #[error("operation requires a running scheduler-managed fiber")]
    NotInFiber,
}
