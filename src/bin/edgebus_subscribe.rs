//! edgebus-subscribe: log every envelope received on a subscriber interface
//!
//! ## Configuration
//! - EDGEBUS_CONFIG: YAML configuration file (optional, `config.yaml` otherwise)
//! - EDGEBUS_INTERFACE: name of the subscriber entry (default: "default")
//! - SUBSCRIBER_ENDPOINT / SUBSCRIBER_<Name>_ENDPOINT: endpoint overrides

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info};

use edgebus::config::{InterfaceRole, MsgbusConfigProvider};
use edgebus::utils::bootstrap::{init_tracing, load_interface};
use edgebus::{BusContext, BusError};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let interface = load_interface(InterfaceRole::Subscriber)?;
    let ctx = BusContext::from_provider(&interface)?;

    let mut subscribers = Vec::new();
    for topic in interface.topics() {
        subscribers.push(Arc::new(ctx.new_subscriber(topic).await?));
    }

    let mut readers = JoinSet::new();
    for subscriber in &subscribers {
        let subscriber = Arc::clone(subscriber);
        readers.spawn(async move {
            loop {
                match subscriber.recv_wait().await {
                    Ok(envelope) => info!(
                        topic = %subscriber.topic(),
                        data = %envelope.to_json(),
                        blobs = envelope.blobs().len(),
                        "Received"
                    ),
                    Err(BusError::Interrupted | BusError::HandleClosed) => break,
                    Err(e) => {
                        error!(topic = %subscriber.topic(), error = %e, "Receive failed");
                        break;
                    }
                }
            }
        });
    }

    info!(transport = %ctx.transport(), topics = subscribers.len(), "edgebus-subscribe started");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    for subscriber in &subscribers {
        subscriber.destroy()?;
    }
    while readers.join_next().await.is_some() {}
    drop(subscribers);
    ctx.destroy()?;
    Ok(())
}
