//! Init process (PID 1) for a queue manager container.
//!
//! ## About
//!
//! When running as the first process of a container we're responsible for
//! two things the kernel normally leaves to `init`: handling process signals
//! and reaping orphaned (zombie) processes. Next to that the logs of the
//! queue manager are mirrored to standard out, so they end up in the
//! container's logs.
//!
//! The supervisor consists of three parts:
//!  * the [signal controller], a control loop on its own thread that handles
//!    process signals and [`ControlToken`]s, and is the only place where
//!    child processes are reaped,
//!  * [log mirrors], worker threads that tail a log file and copy it to a
//!    destination, handling rotation and truncation, and
//!  * the [shutdown coordinator], which cancels all log mirrors and waits for
//!    them to acknowledge, bounded by a grace period.
//!
//! [signal controller]: crate::controller
//! [log mirrors]: crate::mirror
//! [shutdown coordinator]: crate::shutdown
//!
//! ## Reaping
//!
//! Reaping is disabled when the supervisor is started. While the queue
//! manager is being created and started, the commands doing so are waited on
//! directly and reaping them in the control loop would steal their exit
//! status. Once they're done [`ControlToken::BeginReaping`] enables reaping
//! on `SIGCHLD`, followed by [`ControlToken::ReapOnce`] to collect everything
//! that terminated in the meantime.
//!
//! ## Example
//!
//! ```no_run
//! use qminit::{start_supervisor, ControlToken, SupervisorOptions};
//!
//! fn main() -> Result<(), qminit::Error> {
//!     let handle = start_supervisor(SupervisorOptions::default())?;
//!     // Start the managed service here.
//!     handle.dispatch(ControlToken::BeginReaping).map_err(qminit::Error::setup)?;
//!     handle.dispatch(ControlToken::ReapOnce).map_err(qminit::Error::setup)?;
//!     // Returns once we received `SIGTERM`, `SIGINT` or `SIGQUIT`.
//!     let report = handle.await_shutdown()?;
//!     qminit::log::info!("stopped: {}", report);
//!     Ok(())
//! }
//! ```

#![warn(
    anonymous_parameters,
    bare_trait_objects,
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    variant_size_differences
)]
// Disallow warnings when running tests.
#![cfg_attr(test, deny(warnings))]
// Disallow warnings in examples, we want to set a good example after all.
#![doc(test(attr(deny(warnings))))]

pub mod cancel;
pub mod config;
pub mod control;
pub mod controller;
mod error;
pub mod identity;
pub mod instance;
pub mod log;
pub mod mirror;
pub mod provision;
pub mod reap;
pub mod service;
pub mod shutdown;
pub mod signal;

#[doc(no_inline)]
pub use control::{ControlToken, Controller};
#[doc(no_inline)]
pub use controller::{start_supervisor, ServiceStart, SupervisorHandle, SupervisorOptions};
#[doc(inline)]
pub use error::Error;
#[doc(no_inline)]
pub use reap::{ExitStatus, ReapRecord};
#[doc(no_inline)]
pub use shutdown::ShutdownReport;
#[doc(no_inline)]
pub use signal::{Signal, SignalEvent, TerminationReason};

/// Attempts to extract a message from a panic, defaulting to `<unknown>`.
/// NOTE: be sure to derefence the `Box`!
#[doc(hidden)] // Not part of the stable API.
pub fn panic_message<'a>(panic: &'a (dyn std::any::Any + Send + 'static)) -> &'a str {
    match panic.downcast_ref::<&'static str>() {
        Some(s) => s,
        None => match panic.downcast_ref::<String>() {
            Some(s) => s,
            None => "<unknown>",
        },
    }
}
