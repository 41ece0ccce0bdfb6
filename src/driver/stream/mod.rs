//! Framed byte-stream driver for the `ipc`, `tcp` and `fieldbus` transports.
//!
//! Publishers and services bind a hub on the endpoint their name resolves
//! to; one hub per endpoint is shared by every socket of the driver.
//! Subscribers connect lazily in a background task and reconnect with
//! backoff, so they may be created before their publisher. Clients connect
//! eagerly and fail if no service answers.
//!
//! Name resolution:
//! - `ipc`: `<socket_dir>/<name>` (or the configured `socket_file`)
//! - `tcp`: the per-name `host`/`port`, else the default endpoint
//! - `fieldbus`: the endpoint URL's host and port, for every name

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    inbox, Inbox, Received, RecvMode, SocketId, SocketKind, SocketTable, TransportDriver,
    TransportError,
};
use crate::config::{ConfigError, FieldbusConfig, HostPort, IpcConfig, TcpConfig, TransportKind};
use crate::envelope::EncodedMessage;
use crate::transport::{BoxedReader, BoxedWriter, Endpoint, Stream};
use crate::utils::retry::reconnect_backoff;

mod frame;
mod hub;

use frame::{read_frame, write_frame, Frame};
use hub::{Hub, IncomingRequest, Released, HANDSHAKE_TIMEOUT};

/// Replies a client can hold, including late ones to abandoned requests.
const REPLY_BACKLOG: usize = 16;

/// Delay used once the reconnect backoff is exhausted.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// How names map to endpoints for one transport.
enum Resolver {
    Ipc(IpcConfig),
    Tcp(TcpConfig),
    Fieldbus(HostPort),
}

impl Resolver {
    fn resolve(&self, name: &str) -> Result<Endpoint, TransportError> {
        let endpoint = match self {
            Resolver::Ipc(ipc) => Endpoint::Unix(
                ipc.socket_path(name)
                    .ok_or_else(|| TransportError::InvalidName(name.to_string()))?,
            ),
            Resolver::Tcp(tcp) => Endpoint::Tcp(tcp.endpoint(name).clone()),
            Resolver::Fieldbus(hp) => Endpoint::Tcp(hp.clone()),
        };
        Ok(endpoint)
    }
}

struct SubscriberSocket {
    inbox: Inbox<EncodedMessage>,
    task: JoinHandle<()>,
}

impl Drop for SubscriberSocket {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ServiceSocket {
    name: String,
    hub: Arc<Hub>,
    route: u64,
    inbox: Inbox<IncomingRequest>,
    reply_to: Mutex<Option<(u64, mpsc::Sender<Bytes>)>>,
}

impl Drop for ServiceSocket {
    fn drop(&mut self) {
        self.hub.routes().remove_service(&self.name, self.route);
    }
}

struct ClientSocket {
    service: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    inbox: Inbox<(u64, EncodedMessage)>,
    seq: AtomicU64,
    task: JoinHandle<()>,
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum StreamSocket {
    Publisher { topic: String, hub: Arc<Hub> },
    Subscriber(SubscriberSocket),
    Service(ServiceSocket),
    Client(ClientSocket),
}

impl StreamSocket {
    fn kind(&self) -> SocketKind {
        match self {
            StreamSocket::Publisher { .. } => SocketKind::Publisher,
            StreamSocket::Subscriber(_) => SocketKind::Subscriber,
            StreamSocket::Service(_) => SocketKind::Service,
            StreamSocket::Client(_) => SocketKind::Client,
        }
    }

    fn shutdown(&self) {
        match self {
            StreamSocket::Publisher { .. } => {}
            StreamSocket::Subscriber(s) => s.inbox.close(),
            StreamSocket::Service(s) => s.inbox.close(),
            StreamSocket::Client(s) => s.inbox.close(),
        }
    }
}

/// A bound endpoint as seen by the driver.
struct HubSlot {
    hub: Weak<Hub>,
    released: Released,
}

/// Driver for the socket transports.
pub struct StreamDriver {
    kind: TransportKind,
    resolver: Resolver,
    recv_hwm: usize,
    hubs: tokio::sync::Mutex<HashMap<Endpoint, HubSlot>>,
    sockets: SocketTable<StreamSocket>,
}

impl StreamDriver {
    fn new(kind: TransportKind, resolver: Resolver, recv_hwm: usize) -> Self {
        Self {
            kind,
            resolver,
            recv_hwm,
            hubs: tokio::sync::Mutex::new(HashMap::new()),
            sockets: SocketTable::new(),
        }
    }

    /// Open an IPC driver, creating the socket directory if needed.
    pub fn open_ipc(config: &IpcConfig) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(&config.socket_dir)
            .map_err(|e| ConfigError::invalid("socket_dir", e))?;
        info!(socket_dir = %config.socket_dir.display(), "IPC driver initialized");
        Ok(Self::new(
            TransportKind::Ipc,
            Resolver::Ipc(config.clone()),
            config.recv_hwm,
        ))
    }

    pub fn open_tcp(config: &TcpConfig) -> Self {
        info!(
            endpoint = %config.default.addr(),
            overrides = config.endpoints.len(),
            "TCP driver initialized"
        );
        Self::new(TransportKind::Tcp, Resolver::Tcp(config.clone()), config.recv_hwm)
    }

    pub fn open_fieldbus(config: &FieldbusConfig) -> Result<Self, ConfigError> {
        let endpoint = config.host_port()?;
        info!(url = %config.url(), endpoint = %endpoint.addr(), "Field-bus driver initialized");
        Ok(Self::new(
            TransportKind::Fieldbus,
            Resolver::Fieldbus(endpoint),
            config.recv_hwm,
        ))
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.sockets.is_closed() {
            return Err(TransportError::DriverClosed);
        }
        Ok(())
    }

    /// Hub for an endpoint, binding it on first use.
    async fn hub(&self, endpoint: Endpoint) -> Result<Arc<Hub>, TransportError> {
        let mut hubs = self.hubs.lock().await;
        if let Some(hub) = hubs.get(&endpoint).and_then(|slot| slot.hub.upgrade()) {
            return Ok(hub);
        }

        // The previous hub on this endpoint is gone but its listener may
        // still be bound until the aborted accept loop is dropped.
        if let Some(stale) = hubs.remove(&endpoint) {
            let _ = stale.released.await;
            debug!(endpoint = %endpoint, "Previous listener released");
        }

        let (hub, released) = Hub::bind(endpoint.clone(), self.recv_hwm).await?;
        hubs.retain(|_, slot| {
            slot.hub.strong_count() > 0
                || matches!(slot.released.try_recv(), Err(TryRecvError::Empty))
        });
        hubs.insert(
            endpoint,
            HubSlot {
                hub: Arc::downgrade(&hub),
                released,
            },
        );
        Ok(hub)
    }
}

#[async_trait]
impl TransportDriver for StreamDriver {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn bind_publisher(&self, topic: &str) -> Result<SocketId, TransportError> {
        self.ensure_open()?;
        let hub = self.hub(self.resolver.resolve(topic)?).await?;
        self.sockets.insert(StreamSocket::Publisher {
            topic: topic.to_string(),
            hub,
        })
    }

    async fn bind_subscriber(&self, topic: &str) -> Result<SocketId, TransportError> {
        self.ensure_open()?;
        let endpoint = self.resolver.resolve(topic)?;
        let (tx, inbox) = inbox(self.recv_hwm);
        let task = tokio::spawn(run_subscription(endpoint, topic.to_string(), tx));
        self.sockets
            .insert(StreamSocket::Subscriber(SubscriberSocket { inbox, task }))
    }

    async fn bind_service(&self, name: &str) -> Result<SocketId, TransportError> {
        self.ensure_open()?;
        let hub = self.hub(self.resolver.resolve(name)?).await?;
        let (tx, inbox) = inbox(self.recv_hwm);
        let route = hub.routes().add_service(name, tx)?;
        self.sockets.insert(StreamSocket::Service(ServiceSocket {
            name: name.to_string(),
            hub,
            route,
            inbox,
            reply_to: Mutex::new(None),
        }))
    }

    async fn connect_client(&self, name: &str) -> Result<SocketId, TransportError> {
        self.ensure_open()?;
        let endpoint = self.resolver.resolve(name)?;
        let stream = Stream::connect(&endpoint)
            .await
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", endpoint, e)))?;
        let (mut reader, mut writer) = stream.into_split();

        write_frame(
            &mut writer,
            &Frame::Connect {
                service: name.to_string(),
            },
        )
        .await?;

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader)).await {
            Ok(Ok(Some(Frame::Accept))) => {}
            Ok(Ok(Some(Frame::Reject { reason }))) => return Err(TransportError::Rejected(reason)),
            Ok(Ok(Some(other))) => {
                return Err(TransportError::Frame(format!(
                    "unexpected handshake reply {:?}",
                    other
                )))
            }
            Ok(Ok(None)) => return Err(TransportError::Disconnected),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TransportError::Unreachable(format!(
                    "{}: handshake timed out",
                    endpoint
                )))
            }
        }

        info!(service = %name, endpoint = %endpoint, "Client connected");
        let (tx, inbox) = inbox(REPLY_BACKLOG);
        let task = tokio::spawn(read_responses(reader, name.to_string(), tx));
        self.sockets.insert(StreamSocket::Client(ClientSocket {
            service: name.to_string(),
            writer: tokio::sync::Mutex::new(writer),
            inbox,
            seq: AtomicU64::new(0),
            task,
        }))
    }

    async fn send(&self, socket: SocketId, message: EncodedMessage) -> Result<(), TransportError> {
        let socket = self.sockets.get(socket)?;
        match socket.as_ref() {
            StreamSocket::Publisher { topic, hub } => {
                let bytes = message.len();
                let delivered = hub.routes().publish(topic, message)?;
                debug!(topic = %topic, delivered, bytes, "Published");
                Ok(())
            }
            StreamSocket::Client(client) => {
                let seq = client.seq.fetch_add(1, Ordering::SeqCst) + 1;
                let mut writer = client.writer.lock().await;
                write_frame(&mut *writer, &Frame::Request { seq, message }).await?;
                debug!(service = %client.service, seq, "Request sent");
                Ok(())
            }
            StreamSocket::Service(service) => {
                let (seq, reply) = service
                    .reply_to
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .ok_or(TransportError::NoPeer)?;
                let frame = Frame::Response { seq, message }.encode()?;
                match reply.try_send(frame) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(_)) => {
                        warn!(service = %service.name, seq, "Client queue full, dropping response");
                        Ok(())
                    }
                    Err(TrySendError::Closed(_)) => Err(TransportError::Disconnected),
                }
            }
            StreamSocket::Subscriber(_) => Err(TransportError::WrongSocketKind(socket.kind())),
        }
    }

    async fn recv(
        &self,
        socket: SocketId,
        mode: RecvMode,
    ) -> Result<Received<EncodedMessage>, TransportError> {
        let socket = self.sockets.get(socket)?;
        match socket.as_ref() {
            StreamSocket::Subscriber(subscriber) => subscriber.inbox.recv(mode).await,
            StreamSocket::Service(service) => {
                let received = service.inbox.recv(mode).await?;
                Ok(received.map(|request| {
                    *service
                        .reply_to
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some((request.seq, request.reply));
                    request.message
                }))
            }
            StreamSocket::Client(client) => {
                let received = client
                    .inbox
                    .recv_matching(mode, |(seq, _)| *seq == client.seq.load(Ordering::SeqCst))
                    .await?;
                Ok(received.map(|(_, message)| message))
            }
            StreamSocket::Publisher { .. } => Err(TransportError::WrongSocketKind(socket.kind())),
        }
    }

    fn close_socket(&self, socket: SocketId) {
        if let Some(removed) = self.sockets.remove(socket) {
            removed.shutdown();
            debug!(socket = %socket, kind = %removed.kind(), "Socket closed");
        }
    }

    fn close(&self) {
        if let Some(sockets) = self.sockets.close() {
            for socket in &sockets {
                socket.shutdown();
            }
            info!(transport = %self.kind, sockets = sockets.len(), "Driver closed");
        }
    }
}

/// Keep a subscription connected, forwarding publications to the inbox.
///
/// Runs until the subscriber socket is dropped.
async fn run_subscription(endpoint: Endpoint, topic: String, tx: mpsc::Sender<EncodedMessage>) {
    let backoff_builder = reconnect_backoff();
    let mut backoff = backoff_builder.build();

    loop {
        match subscribe(&endpoint, &topic).await {
            Ok((reader, _writer)) => {
                info!(topic = %topic, endpoint = %endpoint, "Subscription connected");
                backoff = backoff_builder.build();

                match forward_publications(reader, &topic, &tx).await {
                    Ok(()) => info!(topic = %topic, "Publisher went away, reconnecting"),
                    Err(e) => warn!(topic = %topic, error = %e, "Subscription failed, reconnecting"),
                }
            }
            Err(e) => {
                debug!(topic = %topic, endpoint = %endpoint, error = %e, "Publisher not reachable");
            }
        }

        if tx.is_closed() {
            return;
        }
        let delay = backoff.next().unwrap_or(MAX_RECONNECT_DELAY);
        tokio::time::sleep(delay).await;
    }
}

/// Connect and send the subscribe handshake.
///
/// The write half is returned so it stays open; dropping it would signal
/// end of stream to the hub.
async fn subscribe(
    endpoint: &Endpoint,
    topic: &str,
) -> Result<(BoxedReader, BoxedWriter), TransportError> {
    let (reader, mut writer) = Stream::connect(endpoint).await?.into_split();
    write_frame(
        &mut writer,
        &Frame::Subscribe {
            topic: topic.to_string(),
        },
    )
    .await?;
    Ok((reader, writer))
}

async fn forward_publications(
    mut reader: BoxedReader,
    topic: &str,
    tx: &mpsc::Sender<EncodedMessage>,
) -> Result<(), TransportError> {
    while let Some(frame) = read_frame(&mut reader).await? {
        match frame {
            Frame::Publish {
                topic: published,
                message,
            } if published == topic => match tx.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(topic = %topic, "Subscriber backlog full, dropping message");
                }
                Err(TrySendError::Closed(_)) => return Ok(()),
            },
            other => warn!(topic = %topic, frame = ?other, "Ignoring unexpected frame"),
        }
    }
    Ok(())
}

async fn read_responses(
    mut reader: BoxedReader,
    service: String,
    tx: mpsc::Sender<(u64, EncodedMessage)>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Response { seq, message })) => match tx.try_send((seq, message)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(service = %service, seq, "Reply backlog full, dropping response");
                }
                Err(TrySendError::Closed(_)) => return,
            },
            Ok(Some(other)) => warn!(service = %service, frame = ?other, "Ignoring unexpected frame"),
            Ok(None) => {
                info!(service = %service, "Service closed connection");
                return;
            }
            Err(e) => {
                warn!(service = %service, error = %e, "Response stream failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests;
