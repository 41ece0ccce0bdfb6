//! Request/response handles.
//!
//! A [`Client`] alternates strictly between `request` and `recv_response`.
//! A [`Service`] alternates between `receive_request` and `respond`; the
//! [`RequestToken`] returned with each request names the exchange a
//! response completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use super::handle::HandleCore;
use super::{BusError, Result};
use crate::driver::{Received, RecvMode, TransportError};
use crate::envelope::{codec, Envelope};

/// Requester connected to one service.
#[derive(Debug)]
pub struct Client {
    core: HandleCore,
    awaiting: AtomicBool,
}

impl Client {
    pub(crate) fn new(core: HandleCore) -> Self {
        Self {
            core,
            awaiting: AtomicBool::new(false),
        }
    }

    /// Name of the service this client is connected to.
    pub fn service(&self) -> &str {
        self.core.name()
    }

    /// True between a successful `request` and the matching response.
    pub fn is_awaiting(&self) -> bool {
        self.awaiting.load(Ordering::Acquire)
    }

    /// Send a request.
    #[tracing::instrument(name = "bus.client.request", skip_all, fields(service = %self.core.name()))]
    pub async fn request(&self, envelope: &Envelope) -> Result<()> {
        self.core.socket()?;
        if self.awaiting.swap(true, Ordering::AcqRel) {
            return Err(BusError::ResponseAlreadyOutstanding);
        }

        if let Err(e) = self.core.send(envelope).await {
            self.awaiting.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Receive the response to the outstanding request.
    #[tracing::instrument(name = "bus.client.recv_response", skip(self), fields(service = %self.core.name()))]
    pub async fn recv_response(&self, mode: RecvMode) -> Result<Received<Envelope>> {
        self.core.socket()?;
        if !self.is_awaiting() {
            return Err(BusError::NoOutstandingRequest);
        }

        match self.core.recv(mode).await {
            Ok(Received::Message(envelope)) => {
                self.awaiting.store(false, Ordering::Release);
                Ok(Received::Message(envelope))
            }
            Err(
                e @ BusError::Receive {
                    source: TransportError::Disconnected,
                    ..
                },
            ) => {
                // No response can arrive over a lost connection.
                self.awaiting.store(false, Ordering::Release);
                Err(e)
            }
            other => other,
        }
    }

    pub async fn recv_wait(&self) -> Result<Envelope> {
        loop {
            if let Received::Message(envelope) = self.recv_response(RecvMode::Blocking).await? {
                return Ok(envelope);
            }
        }
    }

    pub async fn recv_nowait(&self) -> Result<Option<Envelope>> {
        Ok(self.recv_response(RecvMode::NonBlocking).await?.into_message())
    }

    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>> {
        Ok(self
            .recv_response(RecvMode::Timed(timeout))
            .await?
            .into_message())
    }

    /// Send a request and wait at most `timeout` for its response.
    ///
    /// On timeout the request is abandoned (see [`Client::reset`]) and
    /// `Ok(None)` is returned.
    pub async fn call(&self, envelope: &Envelope, timeout: Duration) -> Result<Option<Envelope>> {
        self.request(envelope).await?;
        let response = self.recv_timeout(timeout).await?;
        if response.is_none() {
            warn!(service = %self.core.name(), ?timeout, "Request timed out, abandoning");
            self.reset();
        }
        Ok(response)
    }

    /// Abandon the outstanding request. A late response to it is discarded.
    pub fn reset(&self) {
        if self.awaiting.swap(false, Ordering::AcqRel) {
            debug!(service = %self.core.name(), "Outstanding request abandoned");
        }
    }

    pub fn destroy(&self) -> Result<()> {
        self.core.destroy()
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.is_closed()
    }
}

/// Identifies one request/response exchange on a [`Service`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestToken(Uuid);

/// A request received by a service.
#[derive(Debug)]
pub struct Request {
    pub envelope: Envelope,
    pub token: RequestToken,
}

/// Responder bound to one service name.
#[derive(Debug)]
pub struct Service {
    core: HandleCore,
    pending: Mutex<Option<RequestToken>>,
}

impl Service {
    pub(crate) fn new(core: HandleCore) -> Self {
        Self {
            core,
            pending: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// True while a received request has not been answered.
    pub fn has_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Receive the next request.
    #[tracing::instrument(name = "bus.service.receive_request", skip(self), fields(service = %self.core.name()))]
    pub async fn receive_request(&self, mode: RecvMode) -> Result<Received<Request>> {
        self.core.socket()?;
        if self.has_pending() {
            return Err(BusError::ResponseAlreadyOutstanding);
        }

        let received = self.core.recv(mode).await?;
        Ok(received.map(|envelope| {
            let token = RequestToken(Uuid::new_v4());
            *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
            Request { envelope, token }
        }))
    }

    pub async fn recv_wait(&self) -> Result<Request> {
        loop {
            if let Received::Message(request) = self.receive_request(RecvMode::Blocking).await? {
                return Ok(request);
            }
        }
    }

    pub async fn recv_nowait(&self) -> Result<Option<Request>> {
        Ok(self
            .receive_request(RecvMode::NonBlocking)
            .await?
            .into_message())
    }

    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Request>> {
        Ok(self
            .receive_request(RecvMode::Timed(timeout))
            .await?
            .into_message())
    }

    /// Answer the exchange identified by `token`.
    ///
    /// The exchange ends even if the send fails, so the service can go on
    /// receiving.
    #[tracing::instrument(name = "bus.service.respond", skip_all, fields(service = %self.core.name()))]
    pub async fn respond(&self, token: RequestToken, envelope: &Envelope) -> Result<()> {
        self.core.socket()?;
        let message = codec::encode(envelope)?;

        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.as_ref() != Some(&token) {
                return Err(BusError::NoOutstandingRequest);
            }
            *pending = None;
        }

        self.core.send_encoded(message).await
    }

    pub fn destroy(&self) -> Result<()> {
        self.core.destroy()
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.is_closed()
    }
}
