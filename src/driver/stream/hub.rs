//! Per-endpoint listener shared by the publishers and services of one driver.
//!
//! Peers open a connection and identify themselves with a single handshake
//! frame: `Subscribe { topic }` for subscribers, `Connect { service }` for
//! clients. After that the connection carries only publications (hub to
//! subscriber) or request/response frames (both ways).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::frame::{read_frame, write_frame, Frame};
use crate::driver::TransportError;
use crate::envelope::EncodedMessage;
use crate::transport::{BoxedReader, BoxedWriter, Endpoint, Listener, Stream, UdsCleanupGuard};

/// Time a peer has to send its handshake, and a client to get an answer.
pub(super) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A request delivered to a service socket.
pub(super) struct IncomingRequest {
    pub seq: u64,
    pub message: EncodedMessage,
    /// Outbound queue of the requesting connection (encoded frames).
    pub reply: mpsc::Sender<Bytes>,
}

struct Peer {
    id: u64,
    tx: mpsc::Sender<Bytes>,
}

struct ServiceRoute {
    id: u64,
    tx: mpsc::Sender<IncomingRequest>,
}

/// Routing tables shared between the hub's connections and its sockets.
#[derive(Default)]
pub(super) struct Routes {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<String, Vec<Peer>>>,
    services: Mutex<HashMap<String, ServiceRoute>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Routes {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn add_subscriber(&self, topic: &str, tx: mpsc::Sender<Bytes>) -> u64 {
        let id = self.next_id();
        lock(&self.subscribers)
            .entry(topic.to_string())
            .or_default()
            .push(Peer { id, tx });
        id
    }

    fn remove_subscriber(&self, topic: &str, id: u64) {
        let mut subscribers = lock(&self.subscribers);
        if let Some(peers) = subscribers.get_mut(topic) {
            peers.retain(|p| p.id != id);
            if peers.is_empty() {
                subscribers.remove(topic);
            }
        }
    }

    /// Fan a message out to every connected subscriber of `topic`.
    ///
    /// Never waits: a peer whose queue is full misses the message.
    /// Returns the number of peers the message was queued for.
    pub fn publish(&self, topic: &str, message: EncodedMessage) -> Result<usize, TransportError> {
        let frame = Frame::Publish {
            topic: topic.to_string(),
            message,
        }
        .encode()?;

        let mut subscribers = lock(&self.subscribers);
        let Some(peers) = subscribers.get_mut(topic) else {
            return Ok(0);
        };

        let mut delivered = 0;
        peers.retain(|peer| match peer.tx.try_send(frame.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(topic = %topic, peer = peer.id, "Subscriber queue full, dropping message");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        Ok(delivered)
    }

    /// Route requests for `name` to `tx`. One service per name per hub.
    pub fn add_service(
        &self,
        name: &str,
        tx: mpsc::Sender<IncomingRequest>,
    ) -> Result<u64, TransportError> {
        let mut services = lock(&self.services);
        if services.contains_key(name) {
            return Err(TransportError::AddressInUse(format!("service '{}'", name)));
        }
        let id = self.next_id();
        services.insert(name.to_string(), ServiceRoute { id, tx });
        Ok(id)
    }

    pub fn remove_service(&self, name: &str, id: u64) {
        let mut services = lock(&self.services);
        if services.get(name).is_some_and(|route| route.id == id) {
            services.remove(name);
        }
    }

    fn service(&self, name: &str) -> Option<mpsc::Sender<IncomingRequest>> {
        lock(&self.services).get(name).map(|route| route.tx.clone())
    }

    #[cfg(test)]
    pub(super) fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.subscribers).get(topic).map_or(0, Vec::len)
    }
}

/// Listener owned by the accept loop.
///
/// Fields drop in order, so `released` fires only once the socket is closed.
struct BoundListener {
    listener: Listener,
    _released: oneshot::Sender<()>,
}

/// Resolves once a hub's listener has been closed and its endpoint can be
/// bound again.
pub(super) type Released = oneshot::Receiver<()>;

/// A bound endpoint and its accept loop.
///
/// Dropping the hub stops accepting, tears down every connection and
/// removes the UDS socket file. The listener itself closes when the aborted
/// accept loop is dropped by the runtime; see [`Released`].
pub(super) struct Hub {
    endpoint: Endpoint,
    routes: Arc<Routes>,
    accept_task: JoinHandle<()>,
    _guard: Option<UdsCleanupGuard>,
}

impl Hub {
    pub async fn bind(
        endpoint: Endpoint,
        peer_backlog: usize,
    ) -> Result<(Arc<Self>, Released), TransportError> {
        let (listener, guard) = Listener::bind(&endpoint).await?;
        let (released_tx, released) = oneshot::channel();
        let bound = BoundListener {
            listener,
            _released: released_tx,
        };
        let routes = Arc::new(Routes::default());
        let accept_task = tokio::spawn(accept_loop(
            bound,
            endpoint.clone(),
            routes.clone(),
            peer_backlog,
        ));

        let hub = Arc::new(Self {
            endpoint,
            routes,
            accept_task,
            _guard: guard,
        });
        Ok((hub, released))
    }

    pub fn routes(&self) -> &Routes {
        &self.routes
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.accept_task.abort();
        info!(endpoint = %self.endpoint, "Hub closed");
    }
}

async fn accept_loop(bound: BoundListener, endpoint: Endpoint, routes: Arc<Routes>, backlog: usize) {
    // Connections live in the set so aborting this task aborts them too.
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = bound.listener.accept() => match accepted {
                Ok(stream) => {
                    connections.spawn(serve_connection(stream, routes.clone(), backlog));
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn serve_connection(stream: Stream, routes: Arc<Routes>, backlog: usize) {
    let (mut reader, mut writer) = stream.into_split();

    let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader)).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            warn!(error = %e, "Invalid handshake frame");
            return;
        }
        Err(_) => {
            warn!("Peer sent no handshake, closing connection");
            return;
        }
    };

    match hello {
        Frame::Subscribe { topic } => {
            let (tx, rx) = mpsc::channel(backlog.max(1));
            let id = routes.add_subscriber(&topic, tx);
            info!(topic = %topic, peer = id, "Subscriber connected");

            tokio::select! {
                _ = drain(&mut reader) => {}
                _ = forward(&mut writer, rx) => {}
            }

            routes.remove_subscriber(&topic, id);
            info!(topic = %topic, peer = id, "Subscriber disconnected");
        }
        Frame::Connect { service } => {
            let Some(service_tx) = routes.service(&service) else {
                debug!(service = %service, "Rejecting client for unbound service");
                let reject = Frame::Reject {
                    reason: format!("no service '{}' bound", service),
                };
                let _ = write_frame(&mut writer, &reject).await;
                return;
            };
            if let Err(e) = write_frame(&mut writer, &Frame::Accept).await {
                warn!(service = %service, error = %e, "Failed to accept client");
                return;
            }
            info!(service = %service, "Client connected");

            let (tx, rx) = mpsc::channel(backlog.max(1));
            tokio::select! {
                _ = relay_requests(&mut reader, &service, &service_tx, &tx) => {}
                _ = forward(&mut writer, rx) => {}
            }
            info!(service = %service, "Client disconnected");
        }
        other => {
            warn!(frame = ?other, "Unexpected handshake frame");
        }
    }
}

/// Write queued frames until the queue closes or the peer goes away.
async fn forward(writer: &mut BoxedWriter, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            debug!(error = %e, "Peer write failed");
            return;
        }
    }
}

/// Consume a subscriber connection until it closes. Subscribers send
/// nothing after the handshake.
async fn drain(reader: &mut BoxedReader) {
    loop {
        match read_frame(reader).await {
            Ok(Some(frame)) => warn!(frame = ?frame, "Ignoring frame from subscriber"),
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "Subscriber read failed");
                return;
            }
        }
    }
}

async fn relay_requests(
    reader: &mut BoxedReader,
    service: &str,
    service_tx: &mpsc::Sender<IncomingRequest>,
    reply: &mpsc::Sender<Bytes>,
) {
    loop {
        match read_frame(reader).await {
            Ok(Some(Frame::Request { seq, message })) => {
                debug!(service = %service, seq, bytes = message.len(), "Request received");
                let request = IncomingRequest {
                    seq,
                    message,
                    reply: reply.clone(),
                };
                if service_tx.send(request).await.is_err() {
                    info!(service = %service, "Service closed, dropping client");
                    return;
                }
            }
            Ok(Some(frame)) => warn!(frame = ?frame, "Ignoring unexpected frame from client"),
            Ok(None) => return,
            Err(e) => {
                warn!(service = %service, error = %e, "Client read failed");
                return;
            }
        }
    }
}
