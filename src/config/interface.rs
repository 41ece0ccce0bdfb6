//! Interface configuration: the application-facing side of configuration.
//!
//! An application declares its publishers, subscribers, servers and clients
//! as interface entries:
//!
//! ```yaml
//! interfaces:
//!   Publishers:
//!     - Name: camera_stream
//!       Type: zmq_tcp
//!       EndPoint: 127.0.0.1:65013
//!       Topics: [camera1_stream_results]
//! ```
//!
//! [`MsgbusConfigProvider`] turns an entry into the bus configuration mapping
//! accepted by [`BusContext::new`](crate::bus::BusContext::new).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

use super::transport::{ConfigError, TransportKind, TCP_RESERVED_KEYS, TYPE_KEY};

/// Path segment of the generated field-bus endpoint URL.
const FIELDBUS_PATH: &str = "edgebus";

/// Supplies the bus configuration for one interface.
pub trait MsgbusConfigProvider {
    /// Bus configuration mapping for this interface.
    fn msgbus_config(&self) -> Result<JsonValue, ConfigError>;

    /// Topics published or subscribed to.
    fn topics(&self) -> &[String];

    /// Replace the topic list. Empty topic names are rejected.
    fn set_topics(&mut self, topics: Vec<String>) -> Result<(), ConfigError>;

    /// Endpoint after environment overrides.
    fn endpoint(&self) -> String;
}

/// Direction of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceRole {
    Publisher,
    Subscriber,
    Server,
    Client,
}

impl InterfaceRole {
    /// Prefix of the endpoint override variables for this role.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            InterfaceRole::Publisher => "PUBLISHER",
            InterfaceRole::Subscriber => "SUBSCRIBER",
            InterfaceRole::Server => "SERVER",
            InterfaceRole::Client => "CLIENT",
        }
    }
}

impl fmt::Display for InterfaceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.env_prefix())
    }
}

/// One interface entry as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    #[serde(rename = "Name", alias = "name")]
    pub name: String,
    /// Transport discriminator (`zmq_ipc`, `zmq_tcp`, `opcua`, `channel`, ...).
    #[serde(rename = "Type", alias = "type")]
    pub transport: String,
    /// Socket directory for IPC, `host:port` otherwise.
    #[serde(rename = "EndPoint", alias = "endpoint", default)]
    pub endpoint: String,
    #[serde(rename = "Topics", alias = "topics", default)]
    pub topics: Vec<String>,
    #[serde(
        rename = "zmq_recv_hwm",
        alias = "recv_hwm",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub recv_hwm: Option<u64>,
}

/// Interface entries grouped by role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Interfaces {
    #[serde(rename = "Publishers", alias = "publishers")]
    pub publishers: Vec<InterfaceConfig>,
    #[serde(rename = "Subscribers", alias = "subscribers")]
    pub subscribers: Vec<InterfaceConfig>,
    #[serde(rename = "Servers", alias = "servers")]
    pub servers: Vec<InterfaceConfig>,
    #[serde(rename = "Clients", alias = "clients")]
    pub clients: Vec<InterfaceConfig>,
}

impl Interfaces {
    fn entries(&self, role: InterfaceRole) -> &[InterfaceConfig] {
        match role {
            InterfaceRole::Publisher => &self.publishers,
            InterfaceRole::Subscriber => &self.subscribers,
            InterfaceRole::Server => &self.servers,
            InterfaceRole::Client => &self.clients,
        }
    }

    /// Look up an interface by role and name.
    pub fn get(&self, role: InterfaceRole, name: &str) -> Option<Interface> {
        self.entries(role)
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| Interface::new(role, entry.clone()))
    }

    /// Every interface of a role, in declaration order.
    pub fn all(&self, role: InterfaceRole) -> Vec<Interface> {
        self.entries(role)
            .iter()
            .map(|entry| Interface::new(role, entry.clone()))
            .collect()
    }
}

/// An interface entry bound to its role.
#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    role: InterfaceRole,
    config: InterfaceConfig,
}

impl Interface {
    pub fn new(role: InterfaceRole, config: InterfaceConfig) -> Self {
        Self { role, config }
    }

    pub fn role(&self) -> InterfaceRole {
        self.role
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    /// Names the bus mapping needs per-name entries for: topics for
    /// publishers and subscribers, the service name for servers and clients.
    fn routed_names(&self) -> Vec<&str> {
        match self.role {
            InterfaceRole::Publisher | InterfaceRole::Subscriber => {
                self.config.topics.iter().map(String::as_str).collect()
            }
            InterfaceRole::Server | InterfaceRole::Client => vec![self.config.name.as_str()],
        }
    }
}

impl MsgbusConfigProvider for Interface {
    fn msgbus_config(&self) -> Result<JsonValue, ConfigError> {
        let kind = TransportKind::parse(&self.config.transport)
            .ok_or_else(|| ConfigError::UnsupportedTransport(self.config.transport.clone()))?;
        let endpoint = self.endpoint();

        let mut mapping = Map::new();
        mapping.insert(TYPE_KEY.to_string(), json!(self.config.transport));
        if let Some(hwm) = self.config.recv_hwm {
            mapping.insert("zmq_recv_hwm".to_string(), json!(hwm));
        }

        match kind {
            TransportKind::Ipc => {
                require_endpoint(&endpoint)?;
                mapping.insert("socket_dir".to_string(), json!(endpoint));
            }
            TransportKind::Tcp => {
                let (host, port) = split_host_port(&endpoint)?;
                mapping.insert("host".to_string(), json!(host));
                mapping.insert("port".to_string(), json!(port));
                for name in self.routed_names() {
                    if TCP_RESERVED_KEYS.contains(&name) {
                        return Err(reserved_name(self.role, name));
                    }
                    mapping.insert(name.to_string(), json!({"host": host, "port": port}));
                }
            }
            TransportKind::Fieldbus => {
                let (host, port) = split_host_port(&endpoint)?;
                let url = format!("opcua://{}:{{port}}/{}", host, FIELDBUS_PATH);
                mapping.insert("endpoint".to_string(), json!(url));
                mapping.insert("port".to_string(), json!(port));
            }
            TransportKind::Channel => {}
        }

        debug!(
            role = %self.role,
            name = %self.config.name,
            transport = %kind,
            "Built bus configuration from interface"
        );
        Ok(JsonValue::Object(mapping))
    }

    fn topics(&self) -> &[String] {
        &self.config.topics
    }

    fn set_topics(&mut self, topics: Vec<String>) -> Result<(), ConfigError> {
        if let Some(index) = topics.iter().position(|t| t.trim().is_empty()) {
            return Err(ConfigError::invalid(
                format!("Topics[{}]", index),
                "topic names must not be empty",
            ));
        }
        if TransportKind::parse(&self.config.transport) == Some(TransportKind::Tcp) {
            if let Some(index) = topics
                .iter()
                .position(|t| TCP_RESERVED_KEYS.contains(&t.as_str()))
            {
                return Err(ConfigError::invalid(
                    format!("Topics[{}]", index),
                    format!("'{}' is reserved by the tcp mapping", topics[index]),
                ));
            }
        }
        self.config.topics = topics;
        Ok(())
    }

    /// Endpoint after environment overrides.
    ///
    /// `<ROLE>_<Name>_ENDPOINT` overrides this interface's endpoint;
    /// `<ROLE>_ENDPOINT` overrides every interface of the role and wins
    /// over the per-name variable. Empty values are ignored.
    fn endpoint(&self) -> String {
        let prefix = self.role.env_prefix();
        let per_name = format!("{}_{}_ENDPOINT", prefix, self.config.name);
        let role_wide = format!("{}_ENDPOINT", prefix);

        [role_wide, per_name]
            .iter()
            .find_map(|var| {
                std::env::var(var)
                    .ok()
                    .filter(|v| !v.is_empty())
                    .inspect(|_| debug!(variable = %var, "Endpoint overridden from environment"))
            })
            .unwrap_or_else(|| self.config.endpoint.clone())
    }
}

fn require_endpoint(endpoint: &str) -> Result<(), ConfigError> {
    if endpoint.trim().is_empty() {
        return Err(ConfigError::MissingKey("EndPoint".to_string()));
    }
    Ok(())
}

fn reserved_name(role: InterfaceRole, name: &str) -> ConfigError {
    let key = match role {
        InterfaceRole::Publisher | InterfaceRole::Subscriber => "Topics",
        InterfaceRole::Server | InterfaceRole::Client => "Name",
    };
    ConfigError::invalid(key, format!("'{}' is reserved by the tcp mapping", name))
}

/// Split a `host:port` endpoint.
fn split_host_port(endpoint: &str) -> Result<(String, u16), ConfigError> {
    require_endpoint(endpoint)?;
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::invalid("EndPoint", format!("expected host:port, got '{}'", endpoint)))?;
    let port = port
        .trim()
        .parse::<u16>()
        .map_err(|e| ConfigError::invalid("EndPoint", format!("bad port '{}': {}", port.trim(), e)))?;
    Ok((host.trim().to_string(), port))
}
