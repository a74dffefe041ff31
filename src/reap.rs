//! Reaping of terminated descendants.

use std::{fmt, io};

use log::{debug, error, trace};

/// Exit status of a reaped process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExitStatus {
    /// Process exited normally with `code`.
    Exited(i32),
    /// Process was terminated by `signal`.
    Signaled(i32),
    /// Any other status reported by `waitpid(2)`.
    Other(i32),
}

impl ExitStatus {
    fn from_raw(status: libc::c_int) -> ExitStatus {
        if libc::WIFEXITED(status) {
            ExitStatus::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            ExitStatus::Signaled(libc::WTERMSIG(status))
        } else {
            ExitStatus::Other(status)
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {}", code),
            ExitStatus::Signaled(signal) => write!(f, "signal {}", signal),
            ExitStatus::Other(status) => write!(f, "raw status {}", status),
        }
    }
}

/// A reaped process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReapRecord {
    /// Process id.
    pub pid: libc::pid_t,
    /// Status the process exited with.
    pub status: ExitStatus,
}

/// Collect a single terminated descendant, without blocking.
///
/// Returns `Ok(None)` if no descendant can be reaped right now, either because
/// all are still running or because we don't have any children.
pub(crate) fn try_reap() -> io::Result<Option<ReapRecord>> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: `waitpid` with `-1` waits for any child, `status` is only
        // read if a child was reaped.
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid > 0 {
            let status = ExitStatus::from_raw(status);
            return Ok(Some(ReapRecord { pid, status }));
        } else if pid == 0 {
            return Ok(None);
        }

        match io::Error::last_os_error() {
            err if err.kind() == io::ErrorKind::Interrupted => continue,
            // No children.
            err if err.raw_os_error() == Some(libc::ECHILD) => return Ok(None),
            err => return Err(err),
        }
    }
}

/// Reap all currently terminated descendants, calling `on_reaped` for each.
///
/// Loops until no more descendants are reapable, never blocking. A failure
/// of `waitpid(2)` (other than having no children) ends the pass, it's logged
/// but otherwise ignored. Returns the number of reaped processes.
pub(crate) fn reap_all<F>(mut on_reaped: F) -> usize
where
    F: FnMut(ReapRecord),
{
    let mut reaped = 0;
    loop {
        match try_reap() {
            Ok(Some(record)) => {
                debug!(
                    "reaped child process: pid={}, status={}",
                    record.pid, record.status
                );
                reaped += 1;
                on_reaped(record);
            }
            Ok(None) => break,
            Err(err) => {
                error!("failed to reap child processes: {}", err);
                break;
            }
        }
    }
    trace!("finished reap pass: reaped={}", reaped);
    reaped
}
