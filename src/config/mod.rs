//! Application configuration.
//!
//! Two layers:
//! - [`transport`]: the typed bus configuration validated from a mapping
//! - [`interface`]: application interface entries that produce such mappings
//!
//! [`Config::load`] reads both from YAML files and environment variables.

pub mod interface;
pub mod transport;

pub use interface::{Interface, InterfaceConfig, InterfaceRole, Interfaces, MsgbusConfigProvider};
pub use transport::{
    ChannelConfig, ConfigError, FieldbusConfig, HostPort, IpcConfig, TcpConfig, TransportConfig,
    TransportKind, DEFAULT_RECV_HWM,
};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EDGEBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EDGEBUS";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bus mapping used directly by applications without interface entries.
    pub bus: Option<serde_json::Value>,
    /// Declared publishers, subscribers, servers and clients.
    pub interfaces: Interfaces,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `EDGEBUS_CONFIG` environment variable (if set)
    /// 4. Environment variables with `EDGEBUS__` prefix and `__` separator
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Interface entry for a role and name.
    pub fn interface(&self, role: InterfaceRole, name: &str) -> Option<Interface> {
        self.interfaces.get(role, name)
    }
}
