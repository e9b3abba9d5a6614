//! Socket implementation of `Channel`.
//!
//! `SocketChannel` connects to the worker over a Unix or TCP socket. The
//! bridge's worker thread drives it: `connect_and_open` builds a
//! current-thread tokio runtime and connects, then `serve` runs the I/O loop
//! on that runtime until the peer closes. Commands queued from the caller's
//! thread reach the loop through an unbounded channel. Every outcome is
//! reported as a `ChannelEvent`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelError, EventSender};
use crate::config::{ChannelAddress, RunnerConfig};
use crate::ipc::framing::{read_message, write_message, FramingError};
use crate::models::{Command, Response, WireRequest, WireResponse};
use crate::sync::lock;

type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Message queued for the I/O loop.
#[derive(Debug)]
enum Outbound {
    Command { id: u64, body: String },
    Completion { body: String },
}

/// Streams opened by `connect_and_open`, waiting for `serve` to drive them.
struct OpenStreams {
    runtime: Runtime,
    reader: BoxedReader,
    writer: BoxedWriter,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
}

/// Persistent socket channel to the worker process.
pub struct SocketChannel {
    address: ChannelAddress,
    connect_timeout: Duration,
    events: EventSender,
    /// Monotonically increasing request ID counter.
    request_id: AtomicU64,
    /// Sender into the I/O loop; `None` before connect and after completion/close.
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    opened: Mutex<Option<OpenStreams>>,
}

impl SocketChannel {
    pub fn new(address: ChannelAddress, connect_timeout: Duration, events: EventSender) -> Self {
        Self {
            address,
            connect_timeout,
            events,
            request_id: AtomicU64::new(1),
            outbound: Mutex::new(None),
            opened: Mutex::new(None),
        }
    }

    pub fn from_config(config: &RunnerConfig, events: EventSender) -> Self {
        Self::new(config.address.clone(), config.connect_timeout, events)
    }

    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Hand a message to the I/O loop. Returns `false` if the channel is closed.
    fn enqueue(&self, message: Outbound) -> bool {
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }
}

impl Channel for SocketChannel {
    fn connect_and_open(&self) -> Result<(), ChannelError> {
        if lock(&self.outbound).is_some() || lock(&self.opened).is_some() {
            return Err(ChannelError::AlreadyOpen);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ChannelError::Runtime)?;

        tracing::debug!("Connecting to {}", self.address);
        let (reader, writer) = runtime
            .block_on(async {
                match tokio::time::timeout(self.connect_timeout, connect(&self.address)).await {
                    Ok(result) => result,
                    Err(_) => Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no connection after {}s", self.connect_timeout.as_secs()),
                    )),
                }
            })
            .map_err(ChannelError::ConnectionFailed)?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *lock(&self.opened) = Some(OpenStreams {
            runtime,
            reader,
            writer,
            outbound_rx,
        });
        *lock(&self.outbound) = Some(outbound_tx);

        self.events.connected();
        Ok(())
    }

    fn serve(&self) {
        let Some(open) = lock(&self.opened).take() else {
            tracing::warn!("serve() called on a channel that was never opened");
            self.events.disconnected();
            return;
        };

        let OpenStreams {
            runtime,
            reader,
            writer,
            outbound_rx,
        } = open;
        runtime.block_on(io_loop(reader, writer, outbound_rx, self.events.clone()));
        drop(runtime);

        // Later sends must see a closed channel before anyone sees the disconnect.
        lock(&self.outbound).take();
        tracing::debug!("Socket I/O loop for {} finished", self.address);
        self.events.disconnected();
    }

    fn send(&self, command: &Command) {
        let id = self.next_id();
        let request = WireRequest::Command {
            id,
            command: command.clone(),
        };
        let body = match serde_json::to_string(&request) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Failed to serialize command {}: {}", command.name, e);
                self.events.command_failed(Response::MalformedRequest);
                return;
            }
        };

        if !self.enqueue(Outbound::Command { id, body }) {
            tracing::warn!("Cannot send command {}: channel is closed", command.name);
            self.events.command_failed(Response::AlreadyClosed);
        }
    }

    fn send_completion(&self) {
        let body = match serde_json::to_string(&WireRequest::Done) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Failed to serialize completion: {}", e);
                return;
            }
        };

        // Take the sender so no command can follow the completion.
        let Some(tx) = lock(&self.outbound).take() else {
            tracing::debug!("Completion not sent: channel is already closed");
            return;
        };
        if tx.send(Outbound::Completion { body }).is_err() {
            tracing::debug!("Completion not sent: I/O loop already finished");
        }
    }
}

async fn connect(address: &ChannelAddress) -> std::io::Result<(BoxedReader, BoxedWriter)> {
    match address {
        ChannelAddress::Unix(path) => {
            let (read_half, write_half) = UnixStream::connect(path).await?.into_split();
            let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
            Ok((BufReader::new(reader), Box::new(write_half)))
        }
        ChannelAddress::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str()).await?;
            stream.set_nodelay(true)?;
            let (read_half, write_half) = stream.into_split();
            let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
            Ok((BufReader::new(reader), Box::new(write_half)))
        }
    }
}

/// Drive one connection until the peer closes it or the stream breaks.
///
/// Reads happen on a separate task so an outbound write never interrupts a
/// partially read message.
async fn io_loop(
    mut reader: BoxedReader,
    mut writer: BoxedWriter,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: EventSender,
) {
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(async move {
        loop {
            let result = read_message(&mut reader).await;
            let stop = matches!(&result, Err(e) if e.is_fatal());
            if inbound_tx.send(result).is_err() || stop {
                break;
            }
        }
    });

    let mut in_flight: Option<u64> = None;
    let mut outbound_open = true;

    loop {
        tokio::select! {
            outbound = outbound_rx.recv(), if outbound_open => match outbound {
                Some(Outbound::Command { id, body }) => {
                    if let Some(previous) = in_flight.replace(id) {
                        tracing::warn!("Command {} sent while {} is still in flight", id, previous);
                    }
                    if let Err(e) = write_message(&mut writer, &body).await {
                        tracing::warn!("Failed to send command {}: {}", id, e);
                        in_flight = None;
                        events.command_failed(Response::ConnectionFailure);
                        break;
                    }
                }
                Some(Outbound::Completion { body }) => {
                    tracing::debug!("Sending completion");
                    if let Err(e) = write_message(&mut writer, &body).await {
                        tracing::debug!("Failed to send completion: {}", e);
                        break;
                    }
                    if let Err(e) = writer.shutdown().await {
                        tracing::debug!("Failed to shut down write half: {}", e);
                    }
                    outbound_open = false;
                }
                None => outbound_open = false,
            },
            inbound = inbound_rx.recv() => match inbound {
                Some(Ok(body)) => dispatch_response(&body, &mut in_flight, &events),
                Some(Err(FramingError::Closed)) | None => {
                    tracing::debug!("Peer closed the connection");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!("Failed to read response: {}", e);
                    if in_flight.take().is_some() {
                        events.command_failed(Response::MalformedResponse);
                    }
                    if e.is_fatal() {
                        break;
                    }
                }
            },
        }
    }

    if let Some(id) = in_flight.take() {
        tracing::debug!("Connection closed with command {} in flight", id);
        events.command_failed(Response::AlreadyClosed);
    }

    // Still-queued commands were never written. Later sends see a closed queue.
    outbound_rx.close();
    while let Ok(message) = outbound_rx.try_recv() {
        if let Outbound::Command { id, .. } = message {
            tracing::debug!("Connection closed before command {} was sent", id);
            events.command_failed(Response::AlreadyClosed);
        }
    }
    reader_task.abort();
}

/// Decode one message from the worker and report it against the in-flight command.
fn dispatch_response(body: &str, in_flight: &mut Option<u64>, events: &EventSender) {
    let response: WireResponse = match serde_json::from_str(body) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("Malformed response from worker: {}", e);
            if in_flight.take().is_some() {
                events.command_failed(Response::MalformedResponse);
            }
            return;
        }
    };

    match (response.id, *in_flight) {
        (_, None) => {
            tracing::warn!("Ignoring response with no command in flight: {:?}", response.id);
            return;
        }
        (Some(id), Some(expected)) if id != expected => {
            tracing::warn!("Ignoring stale response {} (waiting for {})", id, expected);
            return;
        }
        _ => {}
    }
    *in_flight = None;

    if let Some(message) = &response.message {
        tracing::debug!("Worker message: {}", message);
    }
    match response.into_response() {
        Response::Success(payload) => events.response_received(payload),
        failure => events.command_failed(failure),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelEvent;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_dispatch_success_clears_in_flight() {
        let (events, rx) = EventSender::channel();
        let mut in_flight = Some(4);

        dispatch_response(r#"{"id":4,"status":"ok","payload":"PONG"}"#, &mut in_flight, &events);

        assert_eq!(in_flight, None);
        assert_eq!(
            rx.try_recv().unwrap(),
            ChannelEvent::ResponseReceived("PONG".to_string())
        );
    }

    #[test]
    fn test_dispatch_maps_failures() {
        let (events, rx) = EventSender::channel();

        let mut in_flight = Some(1);
        dispatch_response(r#"{"id":1,"status":"error","message":"boom"}"#, &mut in_flight, &events);
        assert_eq!(
            rx.try_recv().unwrap(),
            ChannelEvent::CommandFailed(Response::ServerError)
        );

        let mut in_flight = Some(2);
        dispatch_response(r#"{"id":2,"status":"timeout","timeout_secs":9}"#, &mut in_flight, &events);
        assert_eq!(
            rx.try_recv().unwrap(),
            ChannelEvent::CommandFailed(Response::Timeout(9))
        );

        let mut in_flight = Some(3);
        dispatch_response("not json", &mut in_flight, &events);
        assert_eq!(
            rx.try_recv().unwrap(),
            ChannelEvent::CommandFailed(Response::MalformedResponse)
        );
        assert_eq!(in_flight, None);
    }

    #[test]
    fn test_dispatch_ignores_stale_and_unsolicited() {
        let (events, rx) = EventSender::channel();

        let mut in_flight = Some(5);
        dispatch_response(r#"{"id":4,"status":"ok","payload":"old"}"#, &mut in_flight, &events);
        assert_eq!(in_flight, Some(5));

        let mut idle = None;
        dispatch_response(r#"{"id":5,"status":"ok","payload":"late"}"#, &mut idle, &events);

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_accepts_response_without_id() {
        let (events, rx) = EventSender::channel();
        let mut in_flight = Some(8);

        dispatch_response(r#"{"status":"ok"}"#, &mut in_flight, &events);

        assert_eq!(in_flight, None);
        assert_eq!(rx.try_recv().unwrap(), ChannelEvent::ResponseReceived(String::new()));
    }

    fn closed_streams() -> (BoxedReader, BoxedWriter) {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(tokio::io::empty());
        (BufReader::new(reader), Box::new(tokio::io::sink()))
    }

    #[tokio::test]
    async fn test_command_queued_at_close_is_failed() {
        for _ in 0..50 {
            let (events, rx) = EventSender::channel();
            let (reader, writer) = closed_streams();
            let (tx, outbound_rx) = mpsc::unbounded_channel();
            tx.send(Outbound::Command {
                id: 1,
                body: "{}".to_string(),
            })
            .unwrap();

            io_loop(reader, writer, outbound_rx, events).await;

            let received: Vec<_> = rx.try_iter().collect();
            assert_eq!(
                received,
                vec![ChannelEvent::CommandFailed(Response::AlreadyClosed)]
            );
            assert!(tx
                .send(Outbound::Command {
                    id: 2,
                    body: "{}".to_string(),
                })
                .is_err());
        }
    }

    #[tokio::test]
    async fn test_command_sent_during_close_is_failed() {
        let (events, rx) = EventSender::channel();
        let (reader, writer) = closed_streams();
        let (tx, outbound_rx) = mpsc::unbounded_channel();

        let sender = tokio::spawn(async move {
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            tx.send(Outbound::Command {
                id: 1,
                body: "{}".to_string(),
            })
            .is_ok()
        });
        io_loop(reader, writer, outbound_rx, events).await;
        let accepted = sender.await.unwrap();

        // A command the queue accepted must be failed; a refused one is
        // reported by `SocketChannel::send` itself.
        let received: Vec<_> = rx.try_iter().collect();
        if accepted {
            assert_eq!(
                received,
                vec![ChannelEvent::CommandFailed(Response::AlreadyClosed)]
            );
        } else {
            assert!(received.is_empty(), "unexpected events: {:?}", received);
        }
    }

    #[test]
    fn test_send_before_connect_reports_already_closed() {
        let (events, rx) = EventSender::channel();
        let channel = SocketChannel::new(
            ChannelAddress::Unix("/nonexistent/socket-runner.sock".into()),
            Duration::from_millis(100),
            events,
        );

        channel.send(&Command::new("PING"));

        assert_eq!(
            rx.try_recv().unwrap(),
            ChannelEvent::CommandFailed(Response::AlreadyClosed)
        );
    }

    #[test]
    fn test_connect_to_missing_socket_fails() {
        let (events, rx) = EventSender::channel();
        let channel = SocketChannel::new(
            ChannelAddress::Unix("/nonexistent/socket-runner.sock".into()),
            Duration::from_millis(500),
            events,
        );

        let err = channel.connect_and_open().unwrap_err();
        assert!(matches!(err, ChannelError::ConnectionFailed(_)));
        assert!(rx.try_recv().is_err(), "no event expected on failed connect");
    }

    #[test]
    fn test_request_ids_increase() {
        let (events, _rx) = EventSender::channel();
        let channel = SocketChannel::new(
            ChannelAddress::Tcp("127.0.0.1:1".into()),
            Duration::from_millis(100),
            events,
        );
        let first = channel.next_id();
        assert_eq!(channel.next_id(), first + 1);
        assert_eq!(channel.address(), &ChannelAddress::Tcp("127.0.0.1:1".into()));
    }
}
