//! Callback side of the bridge.
//!
//! Channels report events from their own threads into an `EventSender`.
//! A dedicated dispatcher thread drains that queue and calls the
//! `EventHandler`, so callbacks never run on the caller's thread nor block
//! the socket thread.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::{BridgeState, Shared};
use crate::channel::ChannelEvent;
use crate::models::Response;
use crate::sync::{lock, Rendezvous};

pub(crate) const DISPATCHER_THREAD_NAME: &str = "bridge events";

/// Applies channel events to the bridge state and signals waiters.
#[derive(Clone)]
pub struct EventHandler {
    shared: Arc<Shared>,
}

impl EventHandler {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn handle(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => self.on_connected(),
            ChannelEvent::Disconnected => self.on_disconnected(),
            ChannelEvent::ResponseReceived(payload) => self.on_response(Response::Success(payload)),
            ChannelEvent::CommandFailed(response) => self.on_response(response),
        }
    }

    /// Resolve the in-flight command.
    ///
    /// A success payload is stored before the waiter is released.
    pub fn on_response(&self, response: Response) {
        match response {
            Response::Success(payload) => {
                tracing::debug!("command executed");
                *lock(&self.shared.last_payload) = Some(payload);
            }
            Response::Timeout(secs) => {
                tracing::info!("Runner timed out after {} second(s)", secs);
            }
            failure => {
                tracing::info!("error encountered while executing command: {}", failure);
            }
        }

        if let Err(e) = self.shared.sync.leave(Rendezvous::Command) {
            tracing::warn!("Response arrived with no command waiting: {}", e);
        }
    }

    pub fn on_connected(&self) {
        tracing::debug!("connected!");
    }

    /// Clear the channel and worker handles.
    ///
    /// Only releases a waiter when the close was requested by `shutdown`.
    /// Repeated calls are ignored.
    pub fn on_disconnected(&self) {
        let graceful = {
            let mut lifecycle = lock(&self.shared.lifecycle);
            if lifecycle.disconnected {
                tracing::debug!("Ignoring repeated disconnect");
                return;
            }
            lifecycle.disconnected = true;
            lifecycle.state = BridgeState::Closed;
            lifecycle.graceful
        };

        // Detach rather than join: the disconnect may come from the worker itself.
        drop(lock(&self.shared.worker).take());
        drop(lock(&self.shared.channel).take());
        tracing::debug!("connection closed!");

        if graceful {
            if let Err(e) = self.shared.sync.leave(Rendezvous::Disconnect) {
                tracing::warn!("Disconnect arrived after shutdown stopped waiting: {}", e);
            }
        } else {
            tracing::warn!("Channel closed unexpectedly; further commands will fail");
        }
    }
}

/// Start the thread that feeds queued events to `handler`.
///
/// The thread exits when every `EventSender` for `events` has been dropped.
pub(crate) fn spawn_dispatcher(
    events: Receiver<ChannelEvent>,
    handler: EventHandler,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(DISPATCHER_THREAD_NAME.to_string())
        .spawn(move || {
            while let Ok(event) = events.recv() {
                handler.handle(event);
            }
            tracing::debug!("Event dispatcher exiting");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::EventSender;
    use crate::sync::WaitOutcome;
    use std::time::Duration;

    fn handler() -> (EventHandler, Arc<Shared>) {
        let shared = Arc::new(Shared::new());
        (EventHandler::new(Arc::clone(&shared)), shared)
    }

    fn mark_graceful(shared: &Shared) {
        let mut lifecycle = lock(&shared.lifecycle);
        lifecycle.state = BridgeState::Disconnecting;
        lifecycle.graceful = true;
    }

    #[test]
    fn test_success_is_stored_before_leave() {
        let (handler, shared) = handler();
        shared.sync.enter(Rendezvous::Command).unwrap();

        handler.on_response(Response::Success("PONG".into()));

        assert_eq!(shared.sync.outstanding(), 0);
        assert_eq!(lock(&shared.last_payload).as_deref(), Some("PONG"));
    }

    #[test]
    fn test_failure_leaves_without_storing() {
        let (handler, shared) = handler();
        *lock(&shared.last_payload) = Some("earlier".into());

        for failure in [
            Response::AlreadyClosed,
            Response::ConnectionFailure,
            Response::MalformedRequest,
            Response::MalformedResponse,
            Response::ServerError,
            Response::Timeout(3),
        ] {
            shared.sync.enter(Rendezvous::Command).unwrap();
            handler.on_response(failure);
            assert_eq!(shared.sync.outstanding(), 0);
        }

        assert_eq!(lock(&shared.last_payload).as_deref(), Some("earlier"));
    }

    #[test]
    fn test_unsolicited_response_does_not_underflow() {
        let (handler, shared) = handler();
        handler.on_response(Response::Success("late".into()));
        assert_eq!(shared.sync.outstanding(), 0);
    }

    #[test]
    fn test_connected_does_not_leave() {
        let (handler, shared) = handler();
        shared.sync.enter(Rendezvous::Connect).unwrap();

        handler.on_connected();

        assert_eq!(shared.sync.outstanding(), 1);
    }

    #[test]
    fn test_graceful_disconnect_leaves_once() {
        let (handler, shared) = handler();
        mark_graceful(&shared);
        shared.sync.enter(Rendezvous::Disconnect).unwrap();

        handler.on_disconnected();
        handler.on_disconnected();

        assert_eq!(shared.sync.outstanding(), 0);
        assert_eq!(shared.state(), BridgeState::Closed);
        assert!(lock(&shared.channel).is_none());
        assert!(lock(&shared.worker).is_none());
    }

    #[test]
    fn test_repeated_disconnect_does_not_consume_next_rendezvous() {
        let (handler, shared) = handler();
        mark_graceful(&shared);
        shared.sync.enter(Rendezvous::Disconnect).unwrap();
        shared.sync.enter(Rendezvous::Disconnect).unwrap();

        handler.on_disconnected();
        handler.on_disconnected();

        // Only one of the two enters was matched.
        assert_eq!(shared.sync.outstanding(), 1);
    }

    #[test]
    fn test_unexpected_disconnect_leaves_nothing() {
        let (handler, shared) = handler();
        lock(&shared.lifecycle).state = BridgeState::Executing;
        shared.sync.enter(Rendezvous::Command).unwrap();

        handler.on_disconnected();

        assert_eq!(shared.state(), BridgeState::Closed);
        assert_eq!(shared.sync.outstanding(), 1);
        assert_eq!(shared.sync.pending(), Some(Rendezvous::Command));
    }

    #[test]
    fn test_dispatcher_delivers_events() {
        let (handler, shared) = handler();
        let (events, rx) = EventSender::channel();
        let dispatcher = spawn_dispatcher(rx, handler).unwrap();

        shared.sync.enter(Rendezvous::Command).unwrap();
        events.response_received("from queue");
        assert_eq!(
            shared.sync.wait(Duration::from_secs(5)),
            WaitOutcome::Signaled
        );
        assert_eq!(lock(&shared.last_payload).as_deref(), Some("from queue"));

        drop(events);
        dispatcher.join().unwrap();
    }
}
