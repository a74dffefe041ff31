//! Module containing the crate's error type.

use std::any::Any;
use std::{fmt, io};

use crate::controller;

/// Error returned by the supervisor or the stages leading up to it.
pub struct Error {
    inner: ErrorInner,
}

/// Inside of `Error` error.
enum ErrorInner {
    /// Setup error, created via [`Error::setup`].
    Setup(StringError),
    /// Error initialising the supervisor.
    InitSupervisor(io::Error),
    /// Error in the supervisor's control loop.
    Supervisor(controller::Error),
    /// Panic in the supervisor's control loop.
    SupervisorPanic(StringError),
}

impl Error {
    const DESC: &'static str = "error running queue manager supervisor";

    /// Create an error for a failed setup stage, e.g. provisioning or
    /// starting the managed service.
    ///
    /// The `err` will be converted into a [`String`] (using [`ToString`], which
    /// is implemented for all type that implement [`fmt::Display`]).
    pub fn setup<E>(err: E) -> Error
    where
        E: ToString,
    {
        Error {
            inner: ErrorInner::Setup(StringError(err.to_string())),
        }
    }

    pub(crate) const fn init_supervisor(err: io::Error) -> Error {
        Error {
            inner: ErrorInner::InitSupervisor(err),
        }
    }

    pub(crate) const fn supervisor(err: controller::Error) -> Error {
        Error {
            inner: ErrorInner::Supervisor(err),
        }
    }

    pub(crate) fn supervisor_panic(err: Box<dyn Any + Send + 'static>) -> Error {
        let msg = crate::panic_message(&*err).to_owned();
        Error {
            inner: ErrorInner::SupervisorPanic(StringError(msg)),
        }
    }
}

/// We implement [`Debug`] by using [`Display`] implementation because the
/// [`Termination`] trait uses `Debug` rather then `Display` when returning an
/// `Result`.
///
/// [`Termination`]: std::process::Termination
/// [`Debug`]: std::fmt::Debug
/// [`Display`]: std::fmt::Display
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ErrorInner::*;
        match self.inner {
            Setup(ref err) => write!(f, "{}: {}", Self::DESC, err),
            InitSupervisor(ref err) => {
                write!(f, "{}: error starting supervisor: {}", Self::DESC, err)
            }
            Supervisor(ref err) => {
                write!(f, "{}: error in supervisor thread: {}", Self::DESC, err)
            }
            SupervisorPanic(ref msg) => {
                write!(f, "{}: panic in supervisor thread: {}", Self::DESC, msg)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use ErrorInner::*;
        match self.inner {
            InitSupervisor(ref err) => Some(err),
            Supervisor(ref err) => Some(err),
            Setup(ref err) | SupervisorPanic(ref err) => Some(err),
        }
    }
}

/// Wrapper around `String` to implement the [`Error`] trait.
///
/// [`Error`]: std::error::Error
struct StringError(String);

impl fmt::Debug for StringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for StringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for StringError {}
