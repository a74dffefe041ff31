//! Cooperative cancellation.
//!
//! A [`Cancel`] is the (single) owner that can request cancellation, a
//! [`CancelToken`] is handed to each worker to observe it. Cancellation is
//! never forced, workers must check the token between units of work and use
//! [`CancelToken::wait_timeout`] instead of sleeping.
//!
//! Internally this uses a crossbeam channel on which nothing is ever send:
//! cancelling drops the sending side, which disconnects, and thus wakes, all
//! receivers at once.

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{self as crossbeam, RecvTimeoutError, TryRecvError};
use log::debug;
use parking_lot::Mutex;

/// Creates a new cancellation source and its token.
pub fn new() -> (Cancel, CancelToken) {
    let (sender, receiver) = crossbeam::bounded(0);
    let cancel = Cancel {
        sender: Mutex::new(Some(sender)),
    };
    (cancel, CancelToken { receiver })
}

/// Owner of the cancellation signal.
pub struct Cancel {
    /// `None` once cancelled.
    sender: Mutex<Option<crossbeam::Sender<()>>>,
}

impl Cancel {
    /// Request cancellation.
    ///
    /// Calling this more than once has no additional effect. Returns `true`
    /// if this call cancelled, `false` if already cancelled.
    pub fn cancel(&self) -> bool {
        let cancelled = self.sender.lock().take().is_some();
        if cancelled {
            debug!("cancellation requested");
        }
        cancelled
    }

    /// Returns `true` if [`Cancel::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl fmt::Debug for Cancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancel")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Observing side of a [`Cancel`], cheap to clone.
#[derive(Clone)]
pub struct CancelToken {
    receiver: crossbeam::Receiver<()>,
}

impl CancelToken {
    /// Returns `true` if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Wait at most `timeout` for cancellation to be requested.
    ///
    /// Returns `true` if cancelled (possibly before `timeout` elapsed), `false`
    /// if the timeout elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            // Nothing is ever send.
            Ok(()) | Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
