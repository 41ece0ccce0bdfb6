//! Bootstrap utilities for edgebus binaries.

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, ConfigError, Interface, InterfaceRole};

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "EDGEBUS_LOG";

/// Initialize tracing with the EDGEBUS_LOG environment variable.
///
/// Defaults to "info" level if EDGEBUS_LOG is not set. Logs are JSON lines
/// when built with the `json-logs` feature. Safe to call more than once;
/// later calls leave the first subscriber in place.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    #[cfg(feature = "json-logs")]
    let fmt_layer = tracing_subscriber::fmt::layer().json();
    #[cfg(not(feature = "json-logs"))]
    let fmt_layer = tracing_subscriber::fmt::layer();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

/// Environment variable selecting the interface entry a binary uses.
pub const INTERFACE_ENV: &str = "EDGEBUS_INTERFACE";
/// Interface name used when `EDGEBUS_INTERFACE` is unset.
pub const DEFAULT_INTERFACE: &str = "default";

/// Errors raised while preparing a binary's bus interface.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("No {role} interface named '{name}' in configuration")]
    MissingInterface { role: InterfaceRole, name: String },
}

/// Load configuration and select the interface entry for `role`.
///
/// The entry name comes from `EDGEBUS_INTERFACE` (default "default").
pub fn load_interface(role: InterfaceRole) -> Result<Interface, BootstrapError> {
    let config = Config::load(None)?;
    let name = std::env::var(INTERFACE_ENV).unwrap_or_else(|_| DEFAULT_INTERFACE.to_string());

    let interface = config
        .interface(role, &name)
        .ok_or(BootstrapError::MissingInterface { role, name })?;

    info!(
        role = %role,
        name = %interface.name(),
        transport = %interface.config().transport,
        "Interface selected"
    );
    Ok(interface)
}
