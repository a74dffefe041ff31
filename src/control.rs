//! Channel used to send commands into the supervisor's control loop.
//!
//! Messages are send using a [crossbeam channel], after which the control
//! loop is woken from polling using a [`mio::Waker`]. This allows the loop to
//! wait on process signals and commands at the same time.
//!
//! [crossbeam channel]: crossbeam_channel

use std::sync::Arc;
use std::{fmt, io};

use crossbeam_channel as crossbeam;
use log::trace;
use mio::{Registry, Token, Waker};

use crate::mirror::MirrorTask;
use crate::shutdown::ServiceStop;

/// Command for the control loop.
///
/// Tokens are processed strictly in the order they are dispatched.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ControlToken {
    /// Start reaping terminated descendants on every child state change.
    ///
    /// This must only be send after the managed service, and any setup
    /// processes that are waited on directly, have been started.
    BeginReaping,
    /// Run a single reap pass now, regardless of pending notifications.
    ReapOnce,
    /// Shut down, as if a termination signal was received.
    Terminate,
}

impl fmt::Display for ControlToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ControlToken::BeginReaping => "begin-reaping",
            ControlToken::ReapOnce => "reap-once",
            ControlToken::Terminate => "terminate",
        })
    }
}

/// Message send to the control loop.
pub(crate) enum Message {
    /// Process a control token.
    Token(ControlToken),
    /// Register a log mirror task to stop during shutdown.
    Register(Box<MirrorTask>),
    /// Hook to stop the managed service during shutdown.
    ServiceStop(Box<dyn ServiceStop>),
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Token(token) => f.debug_tuple("Token").field(token).finish(),
            Message::Register(task) => f.debug_tuple("Register").field(task).finish(),
            Message::ServiceStop(..) => f.write_str("ServiceStop"),
        }
    }
}

/// Create a new control channel, registering the waker with `registry` using
/// `token`.
pub(crate) fn new(registry: &Registry, token: Token) -> io::Result<(Controller, Receiver)> {
    let waker = Waker::new(registry, token)?;
    let (sender, receiver) = crossbeam::unbounded();
    let controller = Controller {
        sender,
        waker: Arc::new(waker),
    };
    Ok((controller, Receiver { receiver }))
}

/// Sending side of the control channel.
///
/// Can be cloned and shared between threads, all clones send into the same
/// control loop.
#[derive(Clone)]
pub struct Controller {
    sender: crossbeam::Sender<Message>,
    waker: Arc<Waker>,
}

impl Controller {
    /// Send `token` to the control loop.
    ///
    /// This doesn't block. Returns an error if the control loop has already
    /// stopped.
    pub fn dispatch(&self, token: ControlToken) -> io::Result<()> {
        trace!("dispatching control token: token={}", token);
        self.send(Message::Token(token))
    }

    /// Hand over `task` to the control loop, which stops it during shutdown.
    pub(crate) fn register(&self, task: MirrorTask) -> io::Result<()> {
        trace!("registering log mirror: source={}", task.source().display());
        self.send(Message::Register(Box::new(task)))
    }

    /// Hand over the hook to stop the managed service.
    pub(crate) fn set_service_stop(&self, service: Box<dyn ServiceStop>) -> io::Result<()> {
        self.send(Message::ServiceStop(service))
    }

    fn send(&self, msg: Message) -> io::Result<()> {
        self.sender
            .send(msg)
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "supervisor stopped"))?;
        self.waker.wake()
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("queued", &self.sender.len())
            .finish()
    }
}

/// Receiving side of the control channel, owned by the control loop.
#[derive(Debug)]
pub(crate) struct Receiver {
    receiver: crossbeam::Receiver<Message>,
}

impl Receiver {
    /// Try to receive the next message, in the order they were send.
    pub(crate) fn try_recv(&self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}
