//! Runtime errors
//!
//! Recoverable failures (OS errors, bad registrations, configuration) are
//! reported through [`Error`]. Broken scheduler invariants are not errors:
//! they go through [`fatal`], which logs and aborts the process.

use std::backtrace::Backtrace;
use std::fmt::Display;
use std::io;
use std::os::unix::io::RawFd;
use std::panic::Location;

use thiserror::Error;

use crate::config::ConfigError;
use crate::io::Event;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("event {event:?} is already registered on fd {fd}")]
    EventExists { fd: RawFd, event: Event },

    #[error("invalid file descriptor: {0}")]
    BadFd(RawFd),

    #[error("operation requires a running fiber")]
    NotInFiber,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::BadFd(_) => io::Error::from_raw_os_error(libc::EBADF),
            other => io::Error::other(other),
        }
    }
}

/// Abort the process after an invariant violation.
///
/// Continuing would leave the scheduler in a corrupted state, so there is no
/// recovery path: the message and a backtrace are logged and the process aborts.
#[cold]
#[track_caller]
pub fn fatal(msg: impl Display) -> ! {
    let location = Location::caller();
    let backtrace = Backtrace::force_capture();
    tracing::error!(
        target: "fiberio",
        %location,
        "ASSERTION: {msg}\nbacktrace:\n{backtrace}"
    );
    std::process::abort()
}
