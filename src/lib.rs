//! Socket Runner Library
//!
//! Lets a single control thread issue commands to a long-lived worker
//! process and block until each response arrives:
//!
//! - `bridge` - the blocking `Bridge` and its event handler
//! - `sync` - the counting rendezvous the bridge waits on
//! - `channel` - the `Channel` trait and the events a channel reports
//! - `ipc` - the socket implementation of `Channel`
//! - `models` - commands, responses and their wire format
//! - `config` - environment-driven configuration
//!
//! ```ignore
//! use socket_runner::{Bridge, Command, RunnerConfig, SocketChannel};
//!
//! let config = RunnerConfig::from_env()?;
//! let mut bridge = Bridge::new(config.clone())?;
//! bridge.start_channel(SocketChannel::from_config(&config, bridge.events()))?;
//! let pong = bridge.execute(&Command::new("PING"))?;
//! bridge.shutdown()?;
//! ```

pub mod bridge;
pub mod channel;
pub mod config;
pub mod ipc;
pub mod models;
pub mod sync;

pub use bridge::{Bridge, BridgeError, BridgeState, FATAL_EXIT_CODE};
pub use channel::{Channel, ChannelEvent, EventSender};
pub use config::{ChannelAddress, LogMode, RunnerConfig, TimeoutPolicy};
pub use ipc::SocketChannel;
pub use models::{Command, Response};
