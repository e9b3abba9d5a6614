//! Blocking command bridge over a persistent channel.
//!
//! The caller drives the bridge from a single thread:
//!
//! ```text
//! start_channel ──► execute ──► execute ──► ... ──► shutdown
//! ```
//!
//! Each call hands work to another thread and blocks on the bridge's
//! `Synchronizer` until the matching signal arrives:
//!
//! - the background worker thread ("socket thread") opens the channel and
//!   then runs its read loop;
//! - the event dispatcher thread feeds `ChannelEvent`s to the `EventHandler`,
//!   which stores responses and signals the waiting caller.
//!
//! Connect and command timeouts are fatal under the default
//! `TimeoutPolicy::Abort`: the process logs the timeout and exits with
//! `FATAL_EXIT_CODE`. The shutdown timeout is never fatal.

mod handler;

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::channel::{Channel, ChannelError, EventSender};
use crate::config::{RunnerConfig, TimeoutPolicy};
use crate::models::Command;
use crate::sync::{lock, Rendezvous, SyncError, Synchronizer, WaitOutcome};

pub use handler::EventHandler;

/// Exit code used when a connect or command timeout terminates the process.
pub const FATAL_EXIT_CODE: i32 = 70;

const WORKER_THREAD_NAME: &str = "socket thread";

/// Lifecycle of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Connecting,
    Ready,
    Executing,
    Disconnecting,
    Closed,
    /// A connect or command wait timed out (only observable with `TimeoutPolicy::ReturnError`).
    TimedOut,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Channel did not connect within {}s", .0.as_secs_f64())]
    ConnectTimeout(Duration),

    #[error("Command didn't execute within {}s", .0.as_secs_f64())]
    CommandTimeout(Duration),

    #[error("Failed to open channel: {0}")]
    ConnectFailed(#[source] ChannelError),

    /// The channel closed (gracefully or not) and cannot take more work.
    #[error("Channel is not open")]
    ChannelClosed,

    #[error("Cannot {operation} while bridge is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: BridgeState,
    },

    #[error("Failed to spawn {0}: {1}")]
    Spawn(&'static str, #[source] std::io::Error),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// State tracked together so that a disconnect and a shutdown request
/// observe each other atomically.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    pub(crate) state: BridgeState,
    /// Set by `shutdown`; tells the disconnect callback to signal the waiter.
    pub(crate) graceful: bool,
    pub(crate) disconnected: bool,
}

/// Everything the caller thread and the event handler both reach.
pub(crate) struct Shared {
    pub(crate) sync: Synchronizer,
    pub(crate) lifecycle: Mutex<Lifecycle>,
    pub(crate) last_payload: Mutex<Option<String>>,
    pub(crate) channel: Mutex<Option<Arc<dyn Channel>>>,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
    connect_error: Mutex<Option<ChannelError>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            sync: Synchronizer::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: BridgeState::Idle,
                graceful: false,
                disconnected: false,
            }),
            last_payload: Mutex::new(None),
            channel: Mutex::new(None),
            worker: Mutex::new(None),
            connect_error: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> BridgeState {
        lock(&self.lifecycle).state
    }

    /// Move `from -> to`, or report why the caller can't.
    fn transition(
        &self,
        from: BridgeState,
        to: BridgeState,
        operation: &'static str,
    ) -> Result<(), BridgeError> {
        let mut lifecycle = lock(&self.lifecycle);
        match lifecycle.state {
            state if state == from => {
                lifecycle.state = to;
                Ok(())
            }
            BridgeState::Closed => Err(BridgeError::ChannelClosed),
            state => Err(BridgeError::InvalidState { operation, state }),
        }
    }

    /// Move `from -> to` unless something else (a disconnect) already moved the state.
    fn advance(&self, from: BridgeState, to: BridgeState) {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.state == from {
            lifecycle.state = to;
        }
    }

    fn set_state(&self, to: BridgeState) {
        lock(&self.lifecycle).state = to;
    }
}

/// Blocking bridge to a worker process over a `Channel`.
///
/// All operations take `&mut self`, so a second command or a shutdown can
/// never overlap one that is still waiting.
pub struct Bridge {
    config: RunnerConfig,
    shared: Arc<Shared>,
    events: EventSender,
    /// Handle to the event dispatcher thread.
    dispatcher: Option<JoinHandle<()>>,
}

impl Bridge {
    /// Create a bridge and start its event dispatcher thread.
    pub fn new(config: RunnerConfig) -> Result<Self, BridgeError> {
        let shared = Arc::new(Shared::new());
        let (events, events_rx) = EventSender::channel();
        let dispatcher = handler::spawn_dispatcher(events_rx, EventHandler::new(Arc::clone(&shared)))
            .map_err(|e| BridgeError::Spawn(handler::DISPATCHER_THREAD_NAME, e))?;

        Ok(Self {
            config,
            shared,
            events,
            dispatcher: Some(dispatcher),
        })
    }

    /// Sender a channel uses to report events to this bridge.
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn state(&self) -> BridgeState {
        self.shared.state()
    }

    /// Payload of the most recent successful response, if any.
    pub fn last_payload(&self) -> Option<String> {
        lock(&self.shared.last_payload).clone()
    }

    pub fn has_channel(&self) -> bool {
        lock(&self.shared.channel).is_some()
    }

    pub fn has_worker(&self) -> bool {
        lock(&self.shared.worker).is_some()
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.shared.sync
    }

    fn channel(&self) -> Option<Arc<dyn Channel>> {
        lock(&self.shared.channel).clone()
    }

    /// Open `channel` on a background worker thread and block until it is connected.
    ///
    /// The worker signals as soon as `connect_and_open` returns, whether it
    /// succeeded or not, and then keeps running the channel's read loop.
    pub fn start_channel<C: Channel>(&mut self, channel: C) -> Result<(), BridgeError> {
        self.shared
            .transition(BridgeState::Idle, BridgeState::Connecting, "start channel")?;
        self.shared.sync.enter(Rendezvous::Connect)?;

        let channel: Arc<dyn Channel> = Arc::new(channel);
        *lock(&self.shared.channel) = Some(Arc::clone(&channel));

        {
            // Held across spawn so a fast disconnect can't clear the slot before it's filled.
            let mut worker = lock(&self.shared.worker);
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(WORKER_THREAD_NAME.to_string())
                .spawn(move || run_worker(shared, channel));

            match spawned {
                Ok(handle) => *worker = Some(handle),
                Err(e) => {
                    drop(worker);
                    let _ = self.shared.sync.leave(Rendezvous::Connect);
                    lock(&self.shared.channel).take();
                    self.shared.set_state(BridgeState::Closed);
                    return Err(BridgeError::Spawn(WORKER_THREAD_NAME, e));
                }
            }
        }

        let timeout = self.config.connect_timeout;
        if self.shared.sync.wait(timeout) == WaitOutcome::TimedOut {
            let failure = format!(
                "command start socket thread in: {} seconds",
                timeout.as_secs()
            );
            return Err(self.timed_out(
                BridgeError::ConnectTimeout(timeout),
                &failure,
                "socket thread timeout",
            ));
        }

        if let Some(err) = lock(&self.shared.connect_error).take() {
            tracing::error!("Failed to open channel: {}", err);
            lock(&self.shared.channel).take();
            lock(&self.shared.worker).take();
            self.shared.set_state(BridgeState::Closed);
            return Err(BridgeError::ConnectFailed(err));
        }

        self.shared
            .advance(BridgeState::Connecting, BridgeState::Ready);
        tracing::debug!("Channel ready");
        Ok(())
    }

    /// Send `command` and block until the channel answers.
    ///
    /// Returns the most recently stored success payload. A transport
    /// failure resolves the wait without storing anything, so the result is
    /// then whatever the last successful command returned, or `""` if no
    /// command ever succeeded.
    pub fn execute(&mut self, command: &Command) -> Result<String, BridgeError> {
        self.shared
            .transition(BridgeState::Ready, BridgeState::Executing, "execute")?;

        let Some(channel) = self.channel() else {
            self.shared.set_state(BridgeState::Closed);
            return Err(BridgeError::ChannelClosed);
        };
        if let Err(e) = self.shared.sync.enter(Rendezvous::Command) {
            self.shared.advance(BridgeState::Executing, BridgeState::Ready);
            return Err(e.into());
        }

        tracing::debug!("Executing command {}", command.name);
        channel.send(command);
        drop(channel);

        let timeout = self.config.connect_timeout;
        if self.shared.sync.wait(timeout) == WaitOutcome::TimedOut {
            let failure = format!("command didn't execute in: {} seconds", timeout.as_secs());
            return Err(self.timed_out(
                BridgeError::CommandTimeout(timeout),
                &failure,
                "command timeout",
            ));
        }

        self.shared
            .advance(BridgeState::Executing, BridgeState::Ready);
        Ok(self.last_payload().unwrap_or_default())
    }

    /// Ask the worker to finish and wait (bounded) for the channel to close.
    ///
    /// Returns `Ok` once the channel closed or `shutdown_timeout` elapsed,
    /// and immediately if the channel is already closed. After a timeout
    /// (`TimeoutPolicy::ReturnError`) this is a best-effort close.
    pub fn shutdown(&mut self) -> Result<(), BridgeError> {
        {
            let mut lifecycle = lock(&self.shared.lifecycle);
            match lifecycle.state {
                BridgeState::Ready => {}
                BridgeState::TimedOut => {
                    tracing::info!("Closing channel after a timeout");
                }
                BridgeState::Closed => {
                    tracing::info!("Channel already closed; nothing to shut down");
                    return Ok(());
                }
                state => {
                    return Err(BridgeError::InvalidState {
                        operation: "shut down",
                        state,
                    })
                }
            }
            self.shared.sync.enter(Rendezvous::Disconnect)?;
            lifecycle.state = BridgeState::Disconnecting;
            lifecycle.graceful = true;
        }

        match self.channel() {
            Some(channel) => channel.send_completion(),
            None => tracing::debug!("Channel handle already cleared"),
        }

        let timeout = self.config.shutdown_timeout;
        if self.shared.sync.wait(timeout) == WaitOutcome::TimedOut {
            tracing::info!(
                "Channel did not close within {}s; finishing shutdown anyway",
                timeout.as_secs_f64()
            );
        }

        self.shared.set_state(BridgeState::Closed);
        tracing::debug!("Bridge shut down");
        Ok(())
    }

    /// Record a connect/command timeout and apply the configured policy.
    fn timed_out(&self, error: BridgeError, failure: &str, summary: &str) -> BridgeError {
        tracing::error!("timeout: {}", failure);
        tracing::error!("{}", summary);
        self.shared.set_state(BridgeState::TimedOut);

        match self.config.timeout_policy {
            TimeoutPolicy::Abort => std::process::exit(FATAL_EXIT_CODE),
            TimeoutPolicy::ReturnError => error,
        }
    }
}

/// Body of the background worker thread.
fn run_worker(shared: Arc<Shared>, channel: Arc<dyn Channel>) {
    let opened = match channel.connect_and_open() {
        Ok(()) => true,
        Err(e) => {
            *lock(&shared.connect_error) = Some(e);
            false
        }
    };

    // Signal as soon as connect returns; the connected event may still be queued.
    if let Err(e) = shared.sync.leave(Rendezvous::Connect) {
        tracing::warn!("Connect finished after the caller stopped waiting: {}", e);
    }
    drop(shared);

    if opened {
        channel.serve();
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        // Release the bridge's channel handle; the worker keeps its own until it exits.
        lock(&self.shared.channel).take();

        if let Some(handle) = lock(&self.shared.worker).take() {
            join_or_detach(handle, WORKER_THREAD_NAME);
        }

        // The dispatcher exits once every EventSender is gone, ours included.
        let (closed, _) = EventSender::channel();
        drop(std::mem::replace(&mut self.events, closed));
        if let Some(handle) = self.dispatcher.take() {
            join_or_detach(handle, handler::DISPATCHER_THREAD_NAME);
        }
    }
}

/// Join `handle` if the thread finishes quickly, otherwise detach it.
fn join_or_detach(handle: JoinHandle<()>, name: &str) {
    const QUICK_CHECK_INTERVAL: Duration = Duration::from_millis(10);
    const MAX_QUICK_CHECKS: u32 = 10; // 100ms total

    for _ in 0..MAX_QUICK_CHECKS {
        if handle.is_finished() {
            if let Err(e) = handle.join() {
                tracing::warn!("{} panicked during shutdown: {:?}", name, e);
            } else {
                tracing::debug!("{} shut down gracefully", name);
            }
            return;
        }
        thread::sleep(QUICK_CHECK_INTERVAL);
    }

    tracing::debug!(
        "{} still running after {}ms - detaching",
        name,
        QUICK_CHECK_INTERVAL.as_millis() * MAX_QUICK_CHECKS as u128
    );
}
