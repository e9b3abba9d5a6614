//! Boundary between the bridge and a channel implementation.
//!
//! A channel owns the socket and its read loop. It receives work through
//! the `Channel` trait and reports back by pushing `ChannelEvent`s into an
//! `EventSender`, which may be used from any thread.

use std::sync::mpsc::{self, Receiver, Sender};

use thiserror::Error;

use crate::models::{Command, Response};

/// Event reported by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel is open and ready for commands.
    Connected,
    /// The channel closed, gracefully or not.
    Disconnected,
    /// The worker answered the in-flight command.
    ResponseReceived(String),
    /// The in-flight command failed at the transport level.
    CommandFailed(Response),
}

/// Cloneable, thread-safe handle a channel uses to report events.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<ChannelEvent>,
}

impl EventSender {
    /// Create a sender together with the receiving end of its queue.
    pub fn channel() -> (Self, Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    /// Queue an event. Returns `false` if nobody is listening anymore.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::SendError(event)) => {
                tracing::debug!("Dropping channel event {:?}: event handler is gone", event);
                false
            }
        }
    }

    pub fn connected(&self) -> bool {
        self.emit(ChannelEvent::Connected)
    }

    pub fn disconnected(&self) -> bool {
        self.emit(ChannelEvent::Disconnected)
    }

    pub fn response_received(&self, payload: impl Into<String>) -> bool {
        self.emit(ChannelEvent::ResponseReceived(payload.into()))
    }

    pub fn command_failed(&self, response: Response) -> bool {
        self.emit(ChannelEvent::CommandFailed(response))
    }
}

/// Errors from opening a channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The socket could not be connected.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// The I/O runtime for the channel could not be created.
    #[error("Failed to start channel runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// `connect_and_open` was called on a channel that is already open.
    #[error("Channel is already open")]
    AlreadyOpen,
}

/// Operations the bridge needs from a channel.
///
/// `connect_and_open` and `serve` run on the bridge's background worker
/// thread, in that order. `send` and `send_completion` are called from the
/// caller's thread and must not block on the worker's reply; outcomes are
/// reported through the channel's `EventSender`.
pub trait Channel: Send + Sync + 'static {
    /// Connect and open the streams. Should emit `Connected` on success.
    fn connect_and_open(&self) -> Result<(), ChannelError>;

    /// Run the read loop until the channel closes. Should emit `Disconnected`
    /// before returning.
    fn serve(&self);

    /// Queue a command for transmission. Exactly one response or failure
    /// event must eventually follow.
    fn send(&self, command: &Command);

    /// Tell the worker the runner is done. The worker is expected to close
    /// the connection, which surfaces as `Disconnected`.
    fn send_completion(&self);
}
