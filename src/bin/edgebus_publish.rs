//! edgebus-publish: periodic sample publisher
//!
//! Publishes a small envelope on every topic of a `Publishers` interface
//! entry until interrupted. Useful for exercising subscribers.
//!
//! ## Configuration
//! - EDGEBUS_CONFIG: YAML configuration file (optional, `config.yaml` otherwise)
//! - EDGEBUS_INTERFACE: name of the publisher entry (default: "default")
//! - EDGEBUS_INTERVAL_MS: delay between publications (default: 1000)
//! - PUBLISHER_ENDPOINT / PUBLISHER_<Name>_ENDPOINT: endpoint overrides

use std::time::Duration;

use tracing::{info, warn};

use edgebus::config::{InterfaceRole, MsgbusConfigProvider};
use edgebus::utils::bootstrap::{init_tracing, load_interface};
use edgebus::{BusContext, Envelope};

const DEFAULT_INTERVAL_MS: u64 = 1000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let interval_ms = std::env::var("EDGEBUS_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_INTERVAL_MS);

    let interface = load_interface(InterfaceRole::Publisher)?;
    let ctx = BusContext::from_provider(&interface)?;

    let mut publishers = Vec::new();
    for topic in interface.topics() {
        publishers.push(ctx.new_publisher(topic).await?);
    }
    if publishers.is_empty() {
        warn!(name = %interface.name(), "Interface declares no topics, nothing to publish");
    }

    info!(
        transport = %ctx.transport(),
        topics = publishers.len(),
        interval_ms,
        "edgebus-publish started"
    );

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    let mut sequence: u32 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sequence = sequence.wrapping_add(1);
                for publisher in &publishers {
                    let envelope = Envelope::builder()
                        .field("topic", publisher.topic())
                        .field("sequence", sequence)
                        .named_blob("payload", sequence.to_be_bytes().to_vec())
                        .build()?;
                    publisher.publish(&envelope).await?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(published = sequence, "Shutting down");
                break;
            }
        }
    }

    for publisher in &publishers {
        publisher.destroy()?;
    }
    drop(publishers);
    ctx.destroy()?;
    Ok(())
}
