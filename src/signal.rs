//! Process signals and the events the supervisor derives from them.

use std::fmt;

use libc::c_int;

/// Process signal the supervisor listens for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Signal {
    /// Interrupt signal.
    ///
    /// This signal is received by the process when its controlling terminal
    /// wishes to interrupt the process. This signal will for example be send
    /// when Ctrl+C is pressed in most terminals.
    ///
    /// Corresponds to POSIX signal `SIGINT`.
    Interrupt,
    /// Termination request signal.
    ///
    /// This is the signal a container runtime sends when the container is
    /// stopped, and the one we expect to receive during normal operation.
    ///
    /// Corresponds to POSIX signal `SIGTERM`.
    Terminate,
    /// Terminal quit signal.
    ///
    /// Corresponds to POSIX signal `SIGQUIT`.
    Quit,
    /// A child process terminated, was stopped or continued.
    ///
    /// As PID 1 orphaned processes are reparented to us, so this is received
    /// for any descendant, not just the processes we spawned ourselves.
    ///
    /// Corresponds to POSIX signal `SIGCHLD`.
    Child,
}

impl Signal {
    /// All signals the supervisor registers a handler for.
    pub(crate) const ALL: [c_int; 4] = [libc::SIGINT, libc::SIGTERM, libc::SIGQUIT, libc::SIGCHLD];

    /// Convert a raw signal number into our own `Signal`.
    ///
    /// Returns `None` for signals we don't handle.
    pub(crate) fn from_raw(signal: c_int) -> Option<Signal> {
        match signal {
            libc::SIGINT => Some(Signal::Interrupt),
            libc::SIGTERM => Some(Signal::Terminate),
            libc::SIGQUIT => Some(Signal::Quit),
            libc::SIGCHLD => Some(Signal::Child),
            _ => None,
        }
    }

    /// Returns the raw signal number.
    pub fn to_raw(self) -> c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Quit => libc::SIGQUIT,
            Signal::Child => libc::SIGCHLD,
        }
    }

    /// Whether or not the `Signal` is considered a "stopping" signal.
    pub(crate) const fn should_stop(self) -> bool {
        !matches!(self, Signal::Child)
    }

    /// Map the signal to the event the control loop acts on.
    pub(crate) const fn into_event(self) -> SignalEvent {
        if self.should_stop() {
            SignalEvent::TerminationRequested(TerminationReason::Signal(self))
        } else {
            SignalEvent::ChildStateChanged
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alternate = f.alternate();
        f.write_str(match (self, alternate) {
            (Signal::Interrupt, false) => "interrupt",
            (Signal::Interrupt, true) => "interrupt (SIGINT)",
            (Signal::Terminate, false) => "terminate",
            (Signal::Terminate, true) => "terminate (SIGTERM)",
            (Signal::Quit, false) => "quit",
            (Signal::Quit, true) => "quit (SIGQUIT)",
            (Signal::Child, false) => "child",
            (Signal::Child, true) => "child (SIGCHLD)",
        })
    }
}

/// Notification handled by the control loop.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SignalEvent {
    /// A descendant terminated or stopped.
    ChildStateChanged,
    /// The process was asked to shut down.
    TerminationRequested(TerminationReason),
}

/// Why the process is shutting down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TerminationReason {
    /// Received a stopping process signal.
    Signal(Signal),
    /// Requested from within the process, using [`ControlToken::Terminate`],
    /// e.g. after detecting a fatal condition.
    ///
    /// [`ControlToken::Terminate`]: crate::ControlToken::Terminate
    Internal,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Signal(signal) => write!(f, "received signal {:#}", signal),
            TerminationReason::Internal => f.write_str("internal request"),
        }
    }
}
