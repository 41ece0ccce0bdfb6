//! edgebus-call: send one request to a service and print the response
//!
//! Usage: `edgebus-call '<json object>'`
//!
//! ## Configuration
//! - EDGEBUS_CONFIG: YAML configuration file (optional, `config.yaml` otherwise)
//! - EDGEBUS_INTERFACE: name of the `Clients` entry; also the service name
//! - EDGEBUS_TIMEOUT_MS: response timeout (default: 5000)
//! - CLIENT_ENDPOINT / CLIENT_<Name>_ENDPOINT: endpoint overrides

use std::time::Duration;

use tracing::warn;

use edgebus::config::InterfaceRole;
use edgebus::utils::bootstrap::{init_tracing, load_interface};
use edgebus::{BusContext, Envelope};

const DEFAULT_TIMEOUT_MS: u64 = 5000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let body = std::env::args().nth(1).unwrap_or_else(|| "{}".to_string());
    let request = Envelope::from_json(serde_json::from_str(&body)?, Vec::new())?;
    let timeout_ms = std::env::var("EDGEBUS_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_TIMEOUT_MS);

    let interface = load_interface(InterfaceRole::Client)?;
    let ctx = BusContext::from_provider(&interface)?;
    let client = ctx.new_client(interface.name()).await?;

    match client
        .call(&request, Duration::from_millis(timeout_ms))
        .await?
    {
        Some(response) => println!("{}", response.to_json()),
        None => warn!(timeout_ms, "No response"),
    }

    client.destroy()?;
    drop(client);
    ctx.destroy()?;
    Ok(())
}
