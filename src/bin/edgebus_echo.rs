//! edgebus-echo: request/response service that answers with the request
//!
//! ## Configuration
//! - EDGEBUS_CONFIG: YAML configuration file (optional, `config.yaml` otherwise)
//! - EDGEBUS_INTERFACE: name of the `Servers` entry; also the service name
//! - SERVER_ENDPOINT / SERVER_<Name>_ENDPOINT: endpoint overrides

use std::sync::Arc;

use tracing::{info, warn};

use edgebus::config::InterfaceRole;
use edgebus::utils::bootstrap::{init_tracing, load_interface};
use edgebus::{BusContext, BusError, Request};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let interface = load_interface(InterfaceRole::Server)?;
    let ctx = BusContext::from_provider(&interface)?;
    let service = Arc::new(ctx.new_service(interface.name()).await?);

    info!(service = %service.name(), transport = %ctx.transport(), "edgebus-echo started");

    let worker = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            loop {
                let Request { envelope, token } = match service.recv_wait().await {
                    Ok(request) => request,
                    Err(BusError::Interrupted | BusError::HandleClosed) => return Ok(()),
                    Err(e) => return Err(e),
                };
                if let Err(e) = service.respond(token, &envelope).await {
                    warn!(error = %e, "Response not delivered");
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    service.destroy()?;
    worker.await??;
    drop(service);
    ctx.destroy()?;
    Ok(())
}
