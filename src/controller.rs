//! Signal controller: the supervisor's control loop.
//!
//! The control loop runs on its own thread and is the only place where child
//! processes are reaped. It waits on two sources of events using a single
//! [`mio::Poll`]:
//!
//!  * process signals (`SIGINT`, `SIGTERM`, `SIGQUIT` and `SIGCHLD`), and
//!  * [`ControlToken`]s (and mirror registrations) send using a
//!    [`Controller`].
//!
//! All state of the supervisor is owned by the control loop, other threads
//! only communicate with it by sending it messages.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io, thread};

use log::{debug, error, info, trace, warn};
use mio::{Events, Interest, Poll, Token};
use signal_hook_mio::v0_8::Signals;

use crate::cancel::CancelToken;
use crate::control::{self, ControlToken, Controller, Message};
use crate::mirror::{self, Destination, MirrorOptions};
use crate::reap::{self, ReapRecord};
use crate::shutdown::{CompletionCounter, ServiceStop, ShutdownCoordinator, ShutdownReport};
use crate::signal::{Signal, SignalEvent, TerminationReason};

/// Token used to receive process signals.
const SIGNAL: Token = Token(0);
/// Token used to wake up when a message is send.
const CONTROL: Token = Token(1);

/// Options for [`start_supervisor`].
#[derive(Debug, Default)]
pub struct SupervisorOptions {
    /// Maximum time to wait for log mirrors to acknowledge their stop. `None`
    /// waits without bound.
    pub shutdown_grace: Option<Duration>,
}

/// Start the supervisor's control loop on a new thread.
///
/// # Notes
///
/// This must be called before any child process is started, otherwise
/// `SIGCHLD` notifications for those processes could be missed.
pub fn start_supervisor(options: SupervisorOptions) -> Result<SupervisorHandle, crate::Error> {
    let poll = Poll::new().map_err(crate::Error::init_supervisor)?;
    // NOTE: this MUST be done on the calling thread, before returning, to
    // ensure we don't miss any signals.
    let signals = setup_signals(&poll).map_err(crate::Error::init_supervisor)?;
    let (controller, receiver) =
        control::new(poll.registry(), CONTROL).map_err(crate::Error::init_supervisor)?;

    let coordinator = ShutdownCoordinator::new(options.shutdown_grace);
    let cancel = coordinator.cancel_token();
    let completed = coordinator.completed();
    let reaped = Arc::new(AtomicUsize::new(0));
    let stopping = Arc::new(AtomicBool::new(false));

    let supervisor = Supervisor {
        poll,
        signals,
        receiver,
        coordinator,
        state: SupervisorState::new(),
        reaped: reaped.clone(),
        stopping: stopping.clone(),
    };
    let handle = thread::Builder::new()
        .name("supervisor".to_owned())
        .spawn(move || supervisor.run())
        .map_err(crate::Error::init_supervisor)?;
    debug!("started supervisor");

    Ok(SupervisorHandle {
        controller,
        cancel,
        completed,
        reaped,
        stopping,
        handle,
    })
}

/// Set of signals we're listening for.
fn setup_signals(poll: &Poll) -> io::Result<Signals> {
    trace!("setting up signal handling: signals={:?}", Signal::ALL);
    let mut signals = Signals::new(Signal::ALL)?;
    poll.registry()
        .register(&mut signals, SIGNAL, Interest::READABLE)?;
    Ok(signals)
}

/// Handle to the running supervisor.
#[derive(Debug)]
pub struct SupervisorHandle {
    controller: Controller,
    cancel: CancelToken,
    completed: CompletionCounter,
    reaped: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
    handle: thread::JoinHandle<Result<ShutdownReport, crate::Error>>,
}

/// Result of [`SupervisorHandle::start_service`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ServiceStart {
    /// Service is started, it's stopped when the supervisor shuts down.
    Running,
    /// The supervisor started shutting down before the service was running,
    /// the service is stopped (or never started).
    Stopped,
}

impl SupervisorHandle {
    /// Send `token` to the control loop, see [`Controller::dispatch`].
    pub fn dispatch(&self, token: ControlToken) -> io::Result<()> {
        self.controller.dispatch(token)
    }

    /// Returns a [`Controller`] that can be used to dispatch tokens from
    /// other threads.
    pub fn controller(&self) -> Controller {
        self.controller.clone()
    }

    /// Token cancelled when the supervisor shuts down.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Start mirroring `source` to `destination`, the mirror is stopped when
    /// the supervisor shuts down.
    pub fn mirror(
        &self,
        source: std::path::PathBuf,
        destination: Destination,
        options: MirrorOptions,
    ) -> io::Result<()> {
        let task = mirror::start(source, destination, self.cancel.clone(), options)?;
        self.controller.register(task)
    }

    /// Number of log mirrors that have acknowledged their stop, only ever
    /// increases.
    pub fn completed_mirrors(&self) -> CompletionCounter {
        self.completed.clone()
    }

    /// Number of processes reaped so far.
    pub fn reaped(&self) -> usize {
        self.reaped.load(Ordering::Acquire)
    }

    /// Install a hook to stop the managed service during shutdown.
    pub fn set_service_stop<S>(&self, service: S) -> io::Result<()>
    where
        S: ServiceStop + 'static,
    {
        self.controller.set_service_stop(Box::new(service))
    }

    /// Returns `true` once the supervisor started shutting down. After that
    /// control tokens, mirrors and service stop hooks are no longer
    /// handled.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Start the managed service using `start`, installing `service` as stop
    /// hook first so that a termination request arriving while `start` runs
    /// isn't lost.
    ///
    /// If the supervisor started shutting down before or while the service
    /// was started the hook may have run too early, or not at all. In that
    /// case `service` is stopped here and [`ServiceStart::Stopped`] is
    /// returned. If the supervisor was already stopping `start` isn't called.
    pub fn start_service<S, F>(&self, service: S, start: F) -> io::Result<ServiceStart>
    where
        S: ServiceStop + Clone + 'static,
        F: FnOnce(&S) -> io::Result<()>,
    {
        if self.is_stopping() {
            return Ok(ServiceStart::Stopped);
        }
        let mut service_stop = service.clone();
        match self.set_service_stop(service) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::NotConnected => {
                return Ok(ServiceStart::Stopped)
            }
            Err(err) => return Err(err),
        }

        start(&service_stop)?;
        if self.is_stopping() {
            info!("supervisor stopped while starting the service, stopping it");
            if let Err(err) = service_stop.stop_service() {
                warn!("failed to stop service: {}", err);
            }
            return Ok(ServiceStart::Stopped);
        }
        Ok(ServiceStart::Running)
    }

    /// Block until the supervisor has shut down.
    ///
    /// This should be the last call of the process's main thread.
    pub fn await_shutdown(self) -> Result<ShutdownReport, crate::Error> {
        self.handle
            .join()
            .map_err(crate::Error::supervisor_panic)
            .and_then(|res| res)
    }
}

/// State of the supervisor, only accessed by the control loop.
#[derive(Debug)]
struct SupervisorState {
    /// Whether or not we reap on `SIGCHLD`.
    reaping: bool,
    /// Number of registered log mirrors that haven't stopped yet.
    outstanding_mirrors: usize,
}

impl SupervisorState {
    const fn new() -> SupervisorState {
        SupervisorState {
            reaping: false,
            outstanding_mirrors: 0,
        }
    }
}

/// The control loop.
struct Supervisor {
    /// OS poll, used to wait on `signals` and control messages.
    poll: Poll,
    /// Signal notifications.
    signals: Signals,
    receiver: control::Receiver,
    coordinator: ShutdownCoordinator,
    state: SupervisorState,
    /// Reaped processes count, shared for observability.
    reaped: Arc<AtomicUsize>,
    /// Set once we start shutting down.
    stopping: Arc<AtomicBool>,
}

/// Whether to keep running the control loop.
enum Flow {
    Continue,
    Stop(TerminationReason),
}

impl Supervisor {
    /// Run the control loop until a termination request is handled.
    fn run(mut self) -> Result<ShutdownReport, crate::Error> {
        let mut events = Events::with_capacity(8);
        loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                // Can't receive signals any more, but we must still stop the
                // mirrors before the process exits.
                error!("failed to poll for events, shutting down: {}", err);
                let _ = self.shutdown(TerminationReason::Internal);
                return Err(crate::Error::supervisor(Error::Polling(err)));
            }

            for event in events.iter() {
                trace!("got OS event: {:?}", event);
                let flow = match event.token() {
                    SIGNAL => self.handle_signals(),
                    CONTROL => self.handle_messages(),
                    _ => {
                        debug!("unexpected OS event: {:?}", event);
                        Flow::Continue
                    }
                };
                if let Flow::Stop(reason) = flow {
                    return Ok(self.shutdown(reason));
                }
            }
        }
    }

    /// Process all pending signals.
    fn handle_signals(&mut self) -> Flow {
        // Collect first: `handle_event` needs `self` mutably.
        let pending: Vec<Signal> = self
            .signals
            .pending()
            .filter_map(Signal::from_raw)
            .collect();
        for signal in pending {
            debug!("received process signal: signal={:#}", signal);
            if let Flow::Stop(reason) = self.handle_event(signal.into_event()) {
                return Flow::Stop(reason);
            }
        }
        Flow::Continue
    }

    /// Process all queued messages, in order.
    fn handle_messages(&mut self) -> Flow {
        while let Some(msg) = self.receiver.try_recv() {
            match msg {
                Message::Token(token) => {
                    debug!("received control token: token={}", token);
                    if let Flow::Stop(reason) = self.handle_token(token) {
                        return Flow::Stop(reason);
                    }
                }
                Message::Register(task) => {
                    self.state.outstanding_mirrors += 1;
                    self.coordinator.register(*task);
                }
                Message::ServiceStop(service) => self.coordinator.set_service_stop(service),
            }
        }
        Flow::Continue
    }

    /// Handle the messages still queued when shutting down, so that mirrors
    /// registered just before are stopped as well.
    fn drain_messages(&mut self) {
        while let Some(msg) = self.receiver.try_recv() {
            match msg {
                Message::Token(token) => {
                    debug!("ignoring control token during shutdown: token={}", token)
                }
                Message::Register(task) => {
                    self.state.outstanding_mirrors += 1;
                    self.coordinator.register(*task);
                }
                Message::ServiceStop(service) => self.coordinator.set_service_stop(service),
            }
        }
    }

    fn handle_token(&mut self, token: ControlToken) -> Flow {
        match token {
            ControlToken::BeginReaping => {
                info!("reaping child processes from now on");
                self.state.reaping = true;
                Flow::Continue
            }
            ControlToken::ReapOnce => {
                self.reap();
                Flow::Continue
            }
            ControlToken::Terminate => {
                self.handle_event(SignalEvent::TerminationRequested(TerminationReason::Internal))
            }
        }
    }

    fn handle_event(&mut self, event: SignalEvent) -> Flow {
        match event {
            SignalEvent::ChildStateChanged if self.state.reaping => {
                self.reap();
                Flow::Continue
            }
            SignalEvent::ChildStateChanged => {
                trace!("child process changed state, not reaping yet");
                Flow::Continue
            }
            SignalEvent::TerminationRequested(reason) => Flow::Stop(reason),
        }
    }

    /// Reap all terminated descendants.
    fn reap(&mut self) {
        let reaped = &self.reaped;
        let _ = reap::reap_all(|_: ReapRecord| {
            let _ = reaped.fetch_add(1, Ordering::AcqRel);
        });
    }

    /// Stop the service, do a final reap and stop all log mirrors.
    fn shutdown(&mut self, reason: TerminationReason) -> ShutdownReport {
        info!("shutting down: {}", reason);
        // Must be set before draining, anything send after that is dropped.
        self.stopping.store(true, Ordering::Release);
        self.drain_messages();
        self.coordinator.stop_service();
        if self.state.reaping {
            self.reap();
        }
        let report = self.coordinator.shutdown();
        self.state.outstanding_mirrors = self.coordinator.outstanding();
        info!(
            "shut down: {}, outstanding={}, reaped={}",
            report,
            self.state.outstanding_mirrors,
            self.reaped.load(Ordering::Acquire)
        );
        report
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("coordinator", &self.coordinator)
            .field("state", &self.state)
            .finish()
    }
}

/// Error running the control loop.
#[derive(Debug)]
pub(crate) enum Error {
    /// Error polling ([`mio::Poll`]).
    Polling(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Polling(err) => write!(f, "error polling for OS events: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Polling(ref err) => Some(err),
        }
    }
}
