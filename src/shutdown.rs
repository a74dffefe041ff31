//! Orderly shutdown of the log mirrors.
//!
//! The [`ShutdownCoordinator`] is owned by the control loop. Once the process
//! is asked to terminate it stops the managed service (if a [`ServiceStop`]
//! hook is installed), cancels all log mirrors and waits for each of them to
//! acknowledge, tracking progress in a [`CompletionBarrier`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fmt, io};

use log::{debug, error, info, warn};

use crate::cancel::{Cancel, CancelToken};
use crate::mirror::{MirrorExit, MirrorTask};

/// Hook to stop the managed service before the mirrors are stopped, so its
/// final log lines are still copied.
pub trait ServiceStop: Send {
    /// Stop the service, blocking until it has stopped.
    fn stop_service(&mut self) -> io::Result<()>;
}

impl<F> ServiceStop for F
where
    F: FnMut() -> io::Result<()> + Send,
{
    fn stop_service(&mut self) -> io::Result<()> {
        (self)()
    }
}

/// Counter based barrier, tracking how many of the expected workers have
/// completed.
///
/// The counter only ever increases. It can be read from any thread using the
/// handle returned by [`CompletionBarrier::counter`].
#[derive(Debug)]
pub struct CompletionBarrier {
    expected: usize,
    completed: Arc<AtomicUsize>,
}

impl CompletionBarrier {
    /// Create a new barrier, with zero expected workers.
    pub fn new() -> CompletionBarrier {
        CompletionBarrier {
            expected: 0,
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Expect one more worker to complete.
    pub fn expect(&mut self) {
        self.expected += 1;
    }

    /// Mark one worker as completed.
    pub fn arrive(&self) {
        let _ = self.completed.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of expected workers.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Number of workers that haven't completed yet.
    pub fn outstanding(&self) -> usize {
        self.expected.saturating_sub(self.completed.load(Ordering::Acquire))
    }

    /// Returns a handle to read the completed count.
    pub fn counter(&self) -> CompletionCounter {
        CompletionCounter {
            completed: self.completed.clone(),
        }
    }
}

impl Default for CompletionBarrier {
    fn default() -> CompletionBarrier {
        CompletionBarrier::new()
    }
}

/// Read only handle to the completed count of a [`CompletionBarrier`].
#[derive(Clone, Debug)]
pub struct CompletionCounter {
    completed: Arc<AtomicUsize>,
}

impl CompletionCounter {
    /// Number of completed workers.
    pub fn get(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }
}

/// Result of [`ShutdownCoordinator::shutdown`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ShutdownReport {
    /// Number of mirrors that were running.
    pub mirrors: usize,
    /// Mirrors that stopped after copying everything.
    pub stopped: usize,
    /// Mirrors that had already stopped because of an error, or panicked.
    pub failed: usize,
    /// Mirrors that didn't acknowledge within the grace period.
    pub unacknowledged: usize,
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mirrors={}, stopped={}, failed={}, unacknowledged={}",
            self.mirrors, self.stopped, self.failed, self.unacknowledged
        )
    }
}

/// Sequences the stop of all log mirrors.
pub struct ShutdownCoordinator {
    cancel: Cancel,
    token: CancelToken,
    tasks: Vec<MirrorTask>,
    barrier: CompletionBarrier,
    /// Maximum time to wait for all mirrors, `None` waits forever.
    grace: Option<Duration>,
    service: Option<Box<dyn ServiceStop>>,
    /// Set once shut down.
    report: Option<ShutdownReport>,
}

impl ShutdownCoordinator {
    /// Create a new coordinator, waiting at most `grace` for the mirrors to
    /// stop.
    pub fn new(grace: Option<Duration>) -> ShutdownCoordinator {
        let (cancel, token) = crate::cancel::new();
        ShutdownCoordinator {
            cancel,
            token,
            tasks: Vec::new(),
            barrier: CompletionBarrier::new(),
            grace,
            service: None,
            report: None,
        }
    }

    /// Token to pass to log mirrors, cancelled on shutdown.
    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Handle to the number of mirrors that acknowledged their stop.
    pub fn completed(&self) -> CompletionCounter {
        self.barrier.counter()
    }

    /// Install a hook to stop the managed service, replacing any previous
    /// hook.
    pub fn set_service_stop(&mut self, service: Box<dyn ServiceStop>) {
        self.service = Some(service);
    }

    /// Register `task` to be stopped on shutdown.
    ///
    /// If we're already shut down the task is stopped immediately.
    pub fn register(&mut self, task: MirrorTask) {
        self.barrier.expect();
        if self.report.is_some() {
            warn!(
                "log mirror registered after shutdown, stopping it: source={}",
                task.source().display()
            );
            let deadline = self.grace.map(|grace| Instant::now() + grace);
            let _ = self.stop_task(task, deadline);
        } else {
            self.tasks.push(task);
        }
    }

    /// Number of mirrors that haven't acknowledged their stop.
    pub fn outstanding(&self) -> usize {
        self.barrier.outstanding()
    }

    /// Run the service stop hook, if any. The hook is run at most once.
    pub fn stop_service(&mut self) {
        if let Some(mut service) = self.service.take() {
            info!("stopping managed service");
            if let Err(err) = service.stop_service() {
                error!("failed to stop managed service: {}", err);
            }
        }
    }

    /// Stop the service and all log mirrors.
    ///
    /// Calling this more than once returns the report of the first call.
    pub fn shutdown(&mut self) -> ShutdownReport {
        if let Some(report) = self.report {
            debug!("already shut down");
            return report;
        }

        self.stop_service();
        self.report = Some(self.stop_mirrors());
        self.report.unwrap_or_default()
    }

    /// Cancel all mirrors and wait for their acknowledgements.
    fn stop_mirrors(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport {
            mirrors: self.tasks.len(),
            ..ShutdownReport::default()
        };
        debug!("stopping log mirrors: mirrors={}", report.mirrors);
        let _ = self.cancel.cancel();

        let deadline = self.grace.map(|grace| Instant::now() + grace);
        for task in std::mem::take(&mut self.tasks) {
            match self.stop_task(task, deadline) {
                Some(MirrorExit::Cancelled { .. }) => report.stopped += 1,
                Some(MirrorExit::Failed) => report.failed += 1,
                None => report.unacknowledged += 1,
            }
        }

        if self.barrier.outstanding() != 0 {
            warn!(
                "not all log mirrors acknowledged their stop: outstanding={}",
                self.barrier.outstanding()
            );
        }
        debug!("stopped log mirrors: {}", report);
        report
    }

    /// Returns `None` if the task didn't acknowledge.
    fn stop_task(&self, task: MirrorTask, deadline: Option<Instant>) -> Option<MirrorExit> {
        let source = task.source().to_owned();
        match task.stop(&self.cancel, deadline) {
            Ok(exit) => {
                self.barrier.arrive();
                Some(exit)
            }
            Err(err) => {
                error!("{}: source={}", err, source.display());
                match err {
                    // A panicked worker won't ever acknowledge, don't wait on it.
                    crate::mirror::StopError::Panicked(..) => {
                        self.barrier.arrive();
                        Some(MirrorExit::Failed)
                    }
                    crate::mirror::StopError::Timeout => None,
                }
            }
        }
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("cancel", &self.cancel)
            .field("tasks", &self.tasks)
            .field("barrier", &self.barrier)
            .field("grace", &self.grace)
            .field("service", &self.service.is_some())
            .field("report", &self.report)
            .finish()
    }
}
