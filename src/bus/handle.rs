//! State shared by every handle kind.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::{BusError, ContextInner, Result};
use crate::driver::{Received, RecvMode, SocketId, SocketKind, TransportError};
use crate::envelope::{codec, EncodedMessage, Envelope};

/// A driver socket owned by one handle.
///
/// Releasing the socket (explicitly or on drop) wakes any receive pending on
/// it and gives the slot back to the context.
pub(crate) struct HandleCore {
    ctx: Arc<ContextInner>,
    kind: SocketKind,
    name: String,
    socket: SocketId,
    closed: AtomicBool,
}

impl HandleCore {
    pub(crate) fn new(ctx: Arc<ContextInner>, kind: SocketKind, name: &str, socket: SocketId) -> Self {
        Self {
            ctx,
            kind,
            name: name.to_string(),
            socket,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Socket id, or `HandleClosed` once destroyed.
    pub(crate) fn socket(&self) -> Result<SocketId> {
        if self.is_closed() {
            return Err(BusError::HandleClosed);
        }
        Ok(self.socket)
    }

    /// Encode and send an envelope.
    pub(crate) async fn send(&self, envelope: &Envelope) -> Result<()> {
        self.socket()?;
        self.send_encoded(codec::encode(envelope)?).await
    }

    pub(crate) async fn send_encoded(&self, message: EncodedMessage) -> Result<()> {
        let socket = self.socket()?;
        self.ctx
            .driver()
            .send(socket, message)
            .await
            .map_err(|source| BusError::Send {
                name: self.name.clone(),
                source,
            })
    }

    /// Receive and decode the next envelope.
    pub(crate) async fn recv(&self, mode: RecvMode) -> Result<Received<Envelope>> {
        let socket = self.socket()?;
        let received = self
            .ctx
            .driver()
            .recv(socket, mode)
            .await
            .map_err(|e| self.receive_error(e))?;

        match received {
            Received::Message(message) => Ok(Received::Message(codec::decode(message)?)),
            Received::Empty => Ok(Received::Empty),
            Received::TimedOut => Ok(Received::TimedOut),
        }
    }

    fn receive_error(&self, source: TransportError) -> BusError {
        match source {
            TransportError::Interrupted => BusError::Interrupted,
            TransportError::SocketClosed if self.is_closed() => BusError::HandleClosed,
            source => BusError::Receive {
                name: self.name.clone(),
                source,
            },
        }
    }

    /// Close the socket. Returns false if it was already closed.
    fn release(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.ctx.driver().close_socket(self.socket);
        self.ctx.release();
        true
    }

    /// Explicit destroy; a second call fails with `HandleClosed`.
    pub(crate) fn destroy(&self) -> Result<()> {
        if !self.release() {
            return Err(BusError::HandleClosed);
        }
        info!(kind = %self.kind, name = %self.name, socket = %self.socket, "Handle destroyed");
        Ok(())
    }
}

impl Drop for HandleCore {
    fn drop(&mut self) {
        if self.release() {
            debug!(kind = %self.kind, name = %self.name, "Handle released on drop");
        }
    }
}

impl fmt::Debug for HandleCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleCore")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("socket", &self.socket)
            .field("closed", &self.is_closed())
            .finish()
    }
}
