//! Transport driver interface.
//!
//! This module contains:
//! - `TransportDriver` trait: the capability set every backend provides
//! - Socket, receive-mode and error types shared by all drivers
//! - `open_driver`: factory selecting the driver for a transport config
//! - Implementations: in-process channels, framed streams (IPC/TCP/field-bus)
//!
//! Drivers hand out arena-indexed [`SocketId`]s instead of raw handles, so
//! using a socket after `close_socket` is a checked error. Closing an
//! unknown or already-closed socket, and closing an already-closed driver,
//! are no-ops for every driver.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::{ConfigError, TransportConfig, TransportKind};
use crate::envelope::EncodedMessage;

pub mod channel;
mod inbox;
pub mod stream;
mod table;

pub use channel::ChannelDriver;
pub use stream::StreamDriver;

pub(crate) use inbox::{inbox, Inbox};
pub(crate) use table::SocketTable;

/// Arena index of a driver socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket-{}", self.0)
    }
}

/// Role a socket was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Publisher,
    Subscriber,
    Service,
    Client,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketKind::Publisher => "publisher",
            SocketKind::Subscriber => "subscriber",
            SocketKind::Service => "service",
            SocketKind::Client => "client",
        };
        f.write_str(name)
    }
}

/// How a receive suspends when nothing is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    /// Wait until a message arrives or the socket is closed.
    Blocking,
    /// Return immediately.
    NonBlocking,
    /// Wait at most the given duration.
    Timed(Duration),
}

/// Outcome of a receive that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Received<T> {
    Message(T),
    /// Non-blocking receive found nothing queued.
    Empty,
    /// Timed receive reached its deadline.
    TimedOut,
}

impl<T> Received<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Received<U> {
        match self {
            Received::Message(m) => Received::Message(f(m)),
            Received::Empty => Received::Empty,
            Received::TimedOut => Received::TimedOut,
        }
    }

    /// The message, if one was received.
    pub fn into_message(self) -> Option<T> {
        match self {
            Received::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self, Received::Message(_))
    }
}

/// Errors raised by transport drivers.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address already in use: {0}")]
    AddressInUse(String),

    #[error("Name '{0}' does not map to a valid endpoint")]
    InvalidName(String),

    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Peer rejected connection: {0}")]
    Rejected(String),

    #[error("Socket is closed")]
    SocketClosed,

    #[error("Receive interrupted by socket close")]
    Interrupted,

    #[error("Connection to peer lost")]
    Disconnected,

    #[error("Operation not valid on a {0} socket")]
    WrongSocketKind(SocketKind),

    #[error("No request to reply to")]
    NoPeer,

    #[error("Malformed frame: {0}")]
    Frame(String),

    #[error("Driver is closed")]
    DriverClosed,
}

/// Capability set every transport backend provides.
///
/// A driver is opened once per bus context and owns all transport
/// resources (listeners, connections, background tasks) for it.
#[async_trait]
pub trait TransportDriver: Send + Sync {
    /// Transport this driver implements.
    fn kind(&self) -> TransportKind;

    /// Bind a publishing socket for a topic.
    async fn bind_publisher(&self, topic: &str) -> Result<SocketId, TransportError>;

    /// Bind a subscribing socket for a topic.
    async fn bind_subscriber(&self, topic: &str) -> Result<SocketId, TransportError>;

    /// Bind a responder socket for a service name.
    async fn bind_service(&self, name: &str) -> Result<SocketId, TransportError>;

    /// Connect a requester socket to a service name.
    async fn connect_client(&self, name: &str) -> Result<SocketId, TransportError>;

    /// Send an encoded message.
    ///
    /// Publisher sockets fan out to subscribers, client sockets send a
    /// request, service sockets answer the most recently received request.
    async fn send(&self, socket: SocketId, message: EncodedMessage) -> Result<(), TransportError>;

    /// Receive the next message under the given discipline.
    async fn recv(
        &self,
        socket: SocketId,
        mode: RecvMode,
    ) -> Result<Received<EncodedMessage>, TransportError>;

    /// Release a socket. Wakes any receive pending on it.
    fn close_socket(&self, socket: SocketId);

    /// Release every resource held by the driver.
    fn close(&self);
}

/// Open the driver for a validated transport configuration.
pub fn open_driver(config: &TransportConfig) -> Result<Arc<dyn TransportDriver>, ConfigError> {
    let driver: Arc<dyn TransportDriver> = match config {
        TransportConfig::Channel(channel) => Arc::new(ChannelDriver::open(channel)),
        TransportConfig::Ipc(ipc) => Arc::new(StreamDriver::open_ipc(ipc)?),
        TransportConfig::Tcp(tcp) => Arc::new(StreamDriver::open_tcp(tcp)),
        TransportConfig::Fieldbus(fieldbus) => Arc::new(StreamDriver::open_fieldbus(fieldbus)?),
    };

    info!(transport = %config.kind(), "Transport driver opened");
    Ok(driver)
}
