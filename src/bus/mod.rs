//! Message bus for structured data exchange.
//!
//! This module contains:
//! - `BusContext`: validates a configuration mapping, owns the one transport
//!   driver it selects and creates every handle
//! - Publish/subscribe handles: `Publisher`, `Subscriber`
//! - Request/response handles: `Service`, `Client`
//! - `BusError`: the error type of every bus operation
//!
//! Handles keep the context internals alive, and the context refuses to be
//! destroyed while any handle is open, so no handle outlives its driver.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::info;
use uuid::Uuid;

use crate::config::{ConfigError, MsgbusConfigProvider, TransportConfig, TransportKind};
use crate::driver::{open_driver, SocketKind, TransportDriver, TransportError};
use crate::envelope::{CodecError, EnvelopeError};

mod handle;
pub mod pubsub;
pub mod reqresp;

pub use pubsub::{Publisher, Subscriber};
pub use reqresp::{Client, Request, RequestToken, Service};

use handle::HandleCore;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Configuration error: {0}")]
    Config(ConfigError),

    #[error("Unsupported transport type '{0}'")]
    UnsupportedTransport(String),

    #[error("Failed to bind '{name}': {source}")]
    Bind {
        name: String,
        source: TransportError,
    },

    #[error("Failed to connect to '{name}': {source}")]
    Connect {
        name: String,
        source: TransportError,
    },

    #[error("Send on '{name}' failed: {source}")]
    Send {
        name: String,
        source: TransportError,
    },

    #[error("Receive on '{name}' failed: {source}")]
    Receive {
        name: String,
        source: TransportError,
    },

    #[error("Codec error: {0}")]
    Codec(CodecError),

    #[error(transparent)]
    InvalidValueType(#[from] EnvelopeError),

    #[error("A response is already outstanding")]
    ResponseAlreadyOutstanding,

    #[error("No request is outstanding")]
    NoOutstandingRequest,

    #[error("Bus context already destroyed")]
    AlreadyDestroyed,

    #[error("Handle is closed")]
    HandleClosed,

    #[error("Bus context still has {0} open handle(s)")]
    HandlesStillOpen(usize),

    #[error("Receive interrupted by handle destruction")]
    Interrupted,
}

impl From<ConfigError> for BusError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::UnsupportedTransport(name) => BusError::UnsupportedTransport(name),
            other => BusError::Config(other),
        }
    }
}

impl From<CodecError> for BusError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Value(e) => BusError::InvalidValueType(e),
            other => BusError::Codec(other),
        }
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    open_handles: usize,
    destroyed: bool,
}

/// State shared by a context and all of its handles.
pub(crate) struct ContextInner {
    id: Uuid,
    kind: TransportKind,
    driver: Arc<dyn TransportDriver>,
    lifecycle: Mutex<Lifecycle>,
}

impl ContextInner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a handle slot, failing if the context is destroyed.
    fn acquire(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.destroyed {
            return Err(BusError::AlreadyDestroyed);
        }
        lifecycle.open_handles += 1;
        Ok(())
    }

    fn release(&self) {
        let mut lifecycle = self.lifecycle();
        lifecycle.open_handles = lifecycle.open_handles.saturating_sub(1);
    }

    pub(crate) fn driver(&self) -> &dyn TransportDriver {
        self.driver.as_ref()
    }
}

/// Owner of one transport driver and factory for all handles.
///
/// ```no_run
/// # async fn demo() -> edgebus::bus::Result<()> {
/// use edgebus::{BusContext, Envelope};
///
/// let ctx = BusContext::new(&serde_json::json!({"type": "channel"}))?;
/// let publisher = ctx.new_publisher("camera").await?;
/// publisher.publish(&Envelope::builder().field("frame", 1).build()?).await?;
/// publisher.destroy()?;
/// ctx.destroy()?;
/// # Ok(())
/// # }
/// ```
pub struct BusContext {
    inner: Arc<ContextInner>,
}

impl BusContext {
    /// Create a context from a configuration mapping.
    ///
    /// The mapping is fully validated before any transport resource is
    /// opened.
    pub fn new(config: &serde_json::Value) -> Result<Self> {
        let config = TransportConfig::from_mapping(config)?;
        Self::from_config(&config)
    }

    /// Create a context from an already validated configuration.
    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        let driver = open_driver(config)?;
        let inner = Arc::new(ContextInner {
            id: Uuid::new_v4(),
            kind: config.kind(),
            driver,
            lifecycle: Mutex::new(Lifecycle::default()),
        });

        info!(context = %inner.id, transport = %inner.kind, "Bus context created");
        Ok(Self { inner })
    }

    /// Create a context for an interface entry.
    pub fn from_provider(provider: &impl MsgbusConfigProvider) -> Result<Self> {
        Self::new(&provider.msgbus_config()?)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Transport selected by the configuration.
    pub fn transport(&self) -> TransportKind {
        self.inner.kind
    }

    /// Number of handles created and not yet destroyed.
    pub fn open_handles(&self) -> usize {
        self.inner.lifecycle().open_handles
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lifecycle().destroyed
    }

    /// Create a publisher for a topic.
    #[tracing::instrument(name = "bus.new_publisher", skip(self), fields(context = %self.inner.id))]
    pub async fn new_publisher(&self, topic: &str) -> Result<Publisher> {
        let core = self.open(SocketKind::Publisher, topic).await?;
        Ok(Publisher::new(core))
    }

    /// Create a subscriber for a topic.
    #[tracing::instrument(name = "bus.new_subscriber", skip(self), fields(context = %self.inner.id))]
    pub async fn new_subscriber(&self, topic: &str) -> Result<Subscriber> {
        let core = self.open(SocketKind::Subscriber, topic).await?;
        Ok(Subscriber::new(core))
    }

    /// Create a service (responder) for a service name.
    #[tracing::instrument(name = "bus.new_service", skip(self), fields(context = %self.inner.id))]
    pub async fn new_service(&self, name: &str) -> Result<Service> {
        let core = self.open(SocketKind::Service, name).await?;
        Ok(Service::new(core))
    }

    /// Create a client (requester) for a remote service.
    #[tracing::instrument(name = "bus.new_client", skip(self), fields(context = %self.inner.id))]
    pub async fn new_client(&self, name: &str) -> Result<Client> {
        let core = self.open(SocketKind::Client, name).await?;
        Ok(Client::new(core))
    }

    async fn open(&self, kind: SocketKind, name: &str) -> Result<HandleCore> {
        if name.trim().is_empty() {
            return Err(BusError::Config(ConfigError::invalid(
                kind.to_string(),
                "name must not be empty",
            )));
        }

        self.inner.acquire()?;
        let driver = self.inner.driver();
        let bound = match kind {
            SocketKind::Publisher => driver.bind_publisher(name).await,
            SocketKind::Subscriber => driver.bind_subscriber(name).await,
            SocketKind::Service => driver.bind_service(name).await,
            SocketKind::Client => driver.connect_client(name).await,
        };

        let socket = match bound {
            Ok(socket) => socket,
            Err(source) => {
                self.inner.release();
                let name = name.to_string();
                return Err(match kind {
                    SocketKind::Client => BusError::Connect { name, source },
                    _ => BusError::Bind { name, source },
                });
            }
        };

        info!(
            context = %self.inner.id,
            kind = %kind,
            name = %name,
            socket = %socket,
            "Handle opened"
        );
        Ok(HandleCore::new(self.inner.clone(), kind, name, socket))
    }

    /// Release the driver.
    ///
    /// Fails with [`BusError::HandlesStillOpen`] while any handle is open
    /// (the context stays usable) and with [`BusError::AlreadyDestroyed`] on
    /// a second call.
    pub fn destroy(&self) -> Result<()> {
        {
            let mut lifecycle = self.inner.lifecycle();
            if lifecycle.destroyed {
                return Err(BusError::AlreadyDestroyed);
            }
            if lifecycle.open_handles > 0 {
                return Err(BusError::HandlesStillOpen(lifecycle.open_handles));
            }
            lifecycle.destroyed = true;
        }

        self.inner.driver.close();
        info!(context = %self.inner.id, transport = %self.inner.kind, "Bus context destroyed");
        Ok(())
    }
}

impl fmt::Debug for BusContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusContext")
            .field("id", &self.inner.id)
            .field("transport", &self.inner.kind)
            .field("lifecycle", &*self.inner.lifecycle())
            .finish()
    }
}
