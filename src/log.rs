//! Logging related types.
//!
//! Logging is done via the [`log`] crate, the macros of which are re-exported
//! here. The actual logging implementation comes from the [`std-logger`]
//! crate, which writes to standard error. Mirrored log files are written to
//! standard out, so the two don't interleave mid-line.
//!
//! To enable logging call [`init`].
//!
//! [`log`]: https://crates.io/crates/log
//! [`std-logger`]: std_logger

#[doc(no_inline)]
pub use log::{debug, error, info, log, log_enabled, trace, warn};

use crate::config::LogFormat;

/// Initialise logging using `format`. If `debug` is `true` debug messages
/// are logged as well.
///
/// # Notes
///
/// Logging can only be initialised once, calling this function more than
/// once is a no-op.
pub fn init(format: LogFormat, debug: bool) {
    let res = match format {
        LogFormat::Basic => std_logger::Config::logfmt().try_init(),
        LogFormat::Json => std_logger::Config::json().try_init(),
    };
    if res.is_err() {
        return;
    }
    if debug {
        log::set_max_level(log::LevelFilter::Debug);
    }
}
