//! In-process channel driver.
//!
//! Every socket lives in one driver instance, so publishers reach only
//! subscribers created from the same bus context. Publishers fan out to the
//! matching subscribers' bounded backlogs; topic filters match exactly or
//! hierarchically on `.` boundaries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::{
    inbox, Inbox, Received, RecvMode, SocketId, SocketKind, SocketTable, TransportDriver,
    TransportError,
};
use crate::config::{ChannelConfig, TransportKind};
use crate::envelope::EncodedMessage;

/// Replies a client can hold, including late ones to abandoned requests.
const REPLY_BACKLOG: usize = 16;

/// Response tagged with the sequence number of the request it answers.
type Reply = (u64, EncodedMessage);

struct ChannelRequest {
    seq: u64,
    message: EncodedMessage,
    reply: mpsc::Sender<Reply>,
}

enum ChannelSocket {
    Publisher {
        topic: String,
    },
    Subscriber {
        filter: String,
        tx: mpsc::Sender<EncodedMessage>,
        inbox: Inbox<EncodedMessage>,
    },
    Service {
        name: String,
        tx: mpsc::Sender<ChannelRequest>,
        inbox: Inbox<ChannelRequest>,
        reply_to: Mutex<Option<(u64, mpsc::Sender<Reply>)>>,
    },
    Client {
        service: String,
        tx: mpsc::Sender<Reply>,
        inbox: Inbox<Reply>,
        seq: AtomicU64,
    },
}

impl ChannelSocket {
    fn kind(&self) -> SocketKind {
        match self {
            ChannelSocket::Publisher { .. } => SocketKind::Publisher,
            ChannelSocket::Subscriber { .. } => SocketKind::Subscriber,
            ChannelSocket::Service { .. } => SocketKind::Service,
            ChannelSocket::Client { .. } => SocketKind::Client,
        }
    }

    fn shutdown(&self) {
        match self {
            ChannelSocket::Publisher { .. } => {}
            ChannelSocket::Subscriber { inbox, .. } => inbox.close(),
            ChannelSocket::Service { inbox, .. } => inbox.close(),
            ChannelSocket::Client { inbox, .. } => inbox.close(),
        }
    }

    fn is_service(&self, wanted: &str) -> bool {
        matches!(self, ChannelSocket::Service { name, .. } if name == wanted)
    }
}

/// Check if a published topic matches a subscriber's filter.
///
/// Matching rules:
/// - Exact match: "camera" matches "camera"
/// - Hierarchical: "camera" matches "camera.front" (prefix match with dot separator)
pub(crate) fn topic_matches(topic: &str, filter: &str) -> bool {
    if topic == filter {
        return true;
    }
    topic.starts_with(filter) && topic[filter.len()..].starts_with('.')
}

/// Driver for the `channel` transport.
pub struct ChannelDriver {
    recv_hwm: usize,
    sockets: SocketTable<ChannelSocket>,
}

impl ChannelDriver {
    pub fn open(config: &ChannelConfig) -> Self {
        info!(recv_hwm = config.recv_hwm, "Channel driver initialized");
        Self {
            recv_hwm: config.recv_hwm,
            sockets: SocketTable::new(),
        }
    }

    fn service_sender(&self, name: &str) -> Option<mpsc::Sender<ChannelRequest>> {
        self.sockets
            .filter(|s| s.is_service(name))
            .into_iter()
            .find_map(|s| match s.as_ref() {
                ChannelSocket::Service { tx, .. } => Some(tx.clone()),
                _ => None,
            })
    }

    fn publish(&self, topic: &str, message: EncodedMessage) {
        let subscribers = self.sockets.filter(|s| {
            matches!(s, ChannelSocket::Subscriber { filter, .. } if topic_matches(topic, filter))
        });

        let mut delivered = 0usize;
        for subscriber in subscribers {
            let ChannelSocket::Subscriber { filter, tx, .. } = subscriber.as_ref() else {
                continue;
            };
            match tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(topic = %topic, filter = %filter, "Subscriber backlog full, dropping message");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        debug!(topic = %topic, delivered, bytes = message.len(), "Published via channel");
    }
}

#[async_trait]
impl TransportDriver for ChannelDriver {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    async fn bind_publisher(&self, topic: &str) -> Result<SocketId, TransportError> {
        self.sockets.insert(ChannelSocket::Publisher {
            topic: topic.to_string(),
        })
    }

    async fn bind_subscriber(&self, topic: &str) -> Result<SocketId, TransportError> {
        let (tx, inbox) = inbox(self.recv_hwm);
        self.sockets.insert(ChannelSocket::Subscriber {
            filter: topic.to_string(),
            tx,
            inbox,
        })
    }

    async fn bind_service(&self, name: &str) -> Result<SocketId, TransportError> {
        let (tx, inbox) = inbox(self.recv_hwm);
        let socket = ChannelSocket::Service {
            name: name.to_string(),
            tx,
            inbox,
            reply_to: Mutex::new(None),
        };
        self.sockets
            .insert_unique(socket, |s| s.is_service(name), || format!("service '{}'", name))
    }

    async fn connect_client(&self, name: &str) -> Result<SocketId, TransportError> {
        if self.service_sender(name).is_none() {
            return Err(TransportError::Unreachable(format!("no service '{}' bound", name)));
        }

        let (tx, inbox) = inbox(REPLY_BACKLOG);
        self.sockets.insert(ChannelSocket::Client {
            service: name.to_string(),
            tx,
            inbox,
            seq: AtomicU64::new(0),
        })
    }

    async fn send(&self, socket: SocketId, message: EncodedMessage) -> Result<(), TransportError> {
        let socket = self.sockets.get(socket)?;
        match socket.as_ref() {
            ChannelSocket::Publisher { topic } => {
                self.publish(topic, message);
                Ok(())
            }
            ChannelSocket::Client {
                service, tx, seq, ..
            } => {
                let service_tx = self
                    .service_sender(service)
                    .ok_or(TransportError::Disconnected)?;
                let seq = seq.fetch_add(1, Ordering::SeqCst) + 1;
                let request = ChannelRequest {
                    seq,
                    message,
                    reply: tx.clone(),
                };
                service_tx
                    .send(request)
                    .await
                    .map_err(|_| TransportError::Disconnected)
            }
            ChannelSocket::Service { name, reply_to, .. } => {
                let (seq, reply) = reply_to
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .ok_or(TransportError::NoPeer)?;
                match reply.try_send((seq, message)) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(_)) => {
                        warn!(service = %name, seq, "Client reply backlog full, dropping response");
                        Ok(())
                    }
                    Err(TrySendError::Closed(_)) => Err(TransportError::Disconnected),
                }
            }
            ChannelSocket::Subscriber { .. } => Err(TransportError::WrongSocketKind(socket.kind())),
        }
    }

    async fn recv(
        &self,
        socket: SocketId,
        mode: RecvMode,
    ) -> Result<Received<EncodedMessage>, TransportError> {
        let socket = self.sockets.get(socket)?;
        match socket.as_ref() {
            ChannelSocket::Subscriber { inbox, .. } => inbox.recv(mode).await,
            ChannelSocket::Service {
                inbox, reply_to, ..
            } => {
                let received = inbox.recv(mode).await?;
                Ok(received.map(|request| {
                    *reply_to.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some((request.seq, request.reply));
                    request.message
                }))
            }
            ChannelSocket::Client { inbox, seq, .. } => {
                // Responses to abandoned requests carry an older sequence number.
                let received = inbox
                    .recv_matching(mode, |(reply_seq, _)| *reply_seq == seq.load(Ordering::SeqCst))
                    .await?;
                Ok(received.map(|(_, message)| message))
            }
            ChannelSocket::Publisher { .. } => Err(TransportError::WrongSocketKind(socket.kind())),
        }
    }

    fn close_socket(&self, socket: SocketId) {
        if let Some(removed) = self.sockets.remove(socket) {
            removed.shutdown();
            debug!(socket = %socket, kind = %removed.kind(), "Channel socket closed");
        }
    }

    fn close(&self) {
        if let Some(sockets) = self.sockets.close() {
            for socket in &sockets {
                socket.shutdown();
            }
            info!(sockets = sockets.len(), "Channel driver closed");
        }
    }
}
