// SPDX-License-Identifier: MPL-2.0

//! The error type shared by all APIs of this crate.

use std::{fmt, io};

/// The error type which is returned from the APIs of this crate.
#[derive(Debug)]
pub enum Error {
    /// A length, alignment or key argument was not acceptable.
    InvalidArgs,
    /// No IOVA range can satisfy the allocation.
    NoMemory,
    /// A bounded resource (e.g. the request pool) is momentarily empty.
    ///
    /// Distinguished from [`Error::NoMemory`]: the resource will be
    /// replenished once outstanding work completes.
    Busy,
    /// A mapping for the given interval already exists.
    Exists,
    /// The device or transport lacks the requested capability.
    Unsupported,
    /// A spurious completion was observed; the operation may be retried.
    ///
    /// Internal one-shot paths retry on this themselves and never surface it.
    Again,
    /// A bounded wait elapsed before all expected completions arrived.
    TimedOut,
    /// An operating-system or device I/O failure.
    Io(io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Captures `errno` of the calling thread as an [`Error::Io`].
    pub(crate) fn last_os_error() -> Self {
        Error::Io(io::Error::last_os_error())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgs => write!(f, "invalid argument"),
            Error::NoMemory => write!(f, "out of memory"),
            Error::Busy => write!(f, "resource busy"),
            Error::Exists => write!(f, "already exists"),
            Error::Unsupported => write!(f, "operation not supported"),
            Error::Again => write!(f, "try again"),
            Error::TimedOut => write!(f, "timed out"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
