//! Shared bus contract tests.
//!
//! Tests publish/subscribe and request/response semantics against every
//! transport. Each transport test binary builds a `BusContext` and runs
//! these functions through the runner macros.

pub mod pubsub_tests;
pub mod reqresp_tests;

use std::time::Duration;

use edgebus::{Envelope, Publisher, Subscriber};

/// Upper bound for any receive that is expected to succeed.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Marker envelope published while a subscription is still connecting.
pub fn warmup() -> Envelope {
    Envelope::builder()
        .field("warmup", true)
        .build()
        .expect("warmup envelope")
}

pub fn is_warmup(envelope: &Envelope) -> bool {
    envelope.get("warmup").is_some()
}

/// Publish warm-up envelopes until the subscriber receives one.
///
/// Socket subscriptions connect in the background, so publications made
/// before the connection is live are lost.
pub async fn await_connected(publisher: &Publisher, subscriber: &Subscriber) {
    for _ in 0..200 {
        publisher.publish(&warmup()).await.expect("publish warmup");
        let received = subscriber
            .recv_timeout(Duration::from_millis(25))
            .await
            .expect("receive warmup");
        if received.is_some() {
            return;
        }
    }
    panic!("subscriber on '{}' never connected", subscriber.topic());
}

/// Next envelope that is not a warm-up, or None after `timeout`.
pub async fn recv_data(subscriber: &Subscriber, timeout: Duration) -> Option<Envelope> {
    loop {
        match subscriber.recv_timeout(timeout).await.expect("receive") {
            Some(envelope) if is_warmup(&envelope) => continue,
            other => return other,
        }
    }
}
