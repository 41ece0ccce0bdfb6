//! Publish/subscribe handles.

use std::time::Duration;

use tracing::debug;

use super::handle::HandleCore;
use super::Result;
use crate::driver::{Received, RecvMode};
use crate::envelope::Envelope;

/// Fire-and-forget sender on one topic.
///
/// Publishing with no subscriber attached succeeds and drops the message.
#[derive(Debug)]
pub struct Publisher {
    core: HandleCore,
}

impl Publisher {
    pub(crate) fn new(core: HandleCore) -> Self {
        Self { core }
    }

    pub fn topic(&self) -> &str {
        self.core.name()
    }

    /// Publish an envelope to all current subscribers of the topic.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %self.core.name()))]
    pub async fn publish(&self, envelope: &Envelope) -> Result<()> {
        self.core.send(envelope).await?;
        debug!(blobs = envelope.blobs().len(), "Published");
        Ok(())
    }

    /// Close the publisher. A second call fails with `HandleClosed`.
    pub fn destroy(&self) -> Result<()> {
        self.core.destroy()
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.is_closed()
    }
}

/// Receiver of every envelope published on one topic after it connected.
#[derive(Debug)]
pub struct Subscriber {
    core: HandleCore,
}

impl Subscriber {
    pub(crate) fn new(core: HandleCore) -> Self {
        Self { core }
    }

    pub fn topic(&self) -> &str {
        self.core.name()
    }

    /// Receive the next envelope under the given discipline.
    ///
    /// A destroy from another task wakes a pending blocking receive with
    /// [`BusError::Interrupted`](super::BusError::Interrupted).
    #[tracing::instrument(name = "bus.subscriber.recv", skip(self), fields(topic = %self.core.name()))]
    pub async fn recv(&self, mode: RecvMode) -> Result<Received<Envelope>> {
        self.core.recv(mode).await
    }

    /// Wait until an envelope arrives.
    pub async fn recv_wait(&self) -> Result<Envelope> {
        loop {
            if let Received::Message(envelope) = self.recv(RecvMode::Blocking).await? {
                return Ok(envelope);
            }
        }
    }

    /// Take a queued envelope, if any, without waiting.
    pub async fn recv_nowait(&self) -> Result<Option<Envelope>> {
        Ok(self.recv(RecvMode::NonBlocking).await?.into_message())
    }

    /// Wait at most `timeout` for an envelope.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>> {
        Ok(self.recv(RecvMode::Timed(timeout)).await?.into_message())
    }

    pub fn destroy(&self) -> Result<()> {
        self.core.destroy()
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.is_closed()
    }
}
