//! EdgeBus - message bus for edge data pipelines
//!
//! Moves self-describing envelopes (a value mapping plus binary blobs)
//! between producers and consumers over interchangeable transports:
//! in-process channels, Unix domain sockets, TCP and a fieldbus-style
//! endpoint template. Applications use topic-based publish/subscribe or
//! named request/response services through one [`BusContext`].

pub mod bus;
pub mod config;
pub mod driver;
pub mod envelope;
pub mod transport;
pub mod utils;

pub use bus::{
    BusContext, BusError, Client, Publisher, Request, RequestToken, Service, Subscriber,
};
pub use config::{Config, ConfigError, MsgbusConfigProvider, TransportConfig, TransportKind};
pub use driver::{Received, RecvMode};
pub use envelope::{Blob, Envelope, EnvelopeError, Value};
