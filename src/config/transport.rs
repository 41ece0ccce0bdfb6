//! Transport configuration: the bus-facing side of configuration.
//!
//! The bus is constructed from a loosely-typed mapping (as produced by a
//! config store or a JSON file). [`TransportConfig::from_mapping`] validates
//! it eagerly into one of a closed set of typed transport configurations.
//!
//! ```json
//! {"type": "ipc", "socket_dir": "/tmp/edgebus"}
//! {"type": "tcp", "host": "127.0.0.1", "port": 5569, "camera": {"host": "10.0.0.4", "port": 5570}}
//! {"type": "fieldbus", "endpoint": "opcua://localhost:{port}/edgebus", "port": 4840}
//! {"type": "channel"}
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Key holding the transport discriminator.
pub const TYPE_KEY: &str = "type";
/// Backlog bound applied when `recv_hwm` is not configured.
pub const DEFAULT_RECV_HWM: usize = 1000;

const RECV_HWM_KEYS: [&str; 2] = ["recv_hwm", "zmq_recv_hwm"];
/// Top-level keys of a TCP mapping that cannot double as per-name entries.
pub const TCP_RESERVED_KEYS: [&str; 5] = [TYPE_KEY, "host", "port", RECV_HWM_KEYS[0], RECV_HWM_KEYS[1]];
const PORT_PLACEHOLDER: &str = "{port}";

/// Errors raised while validating or loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration key '{0}'")]
    MissingKey(String),

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Unsupported transport type '{0}'")]
    UnsupportedTransport(String),

    #[error("Bus configuration must be a mapping")]
    NotAMapping,

    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Transport discriminator (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Unix domain sockets in a shared directory.
    Ipc,
    /// TCP sockets.
    Tcp,
    /// Field-bus endpoint addressed by a URL template.
    Fieldbus,
    /// In-process channels, scoped to one bus context.
    Channel,
}

impl TransportKind {
    /// Parse a discriminator, accepting the legacy `zmq_*`/`opcua` names.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ipc" | "zmq_ipc" => Some(TransportKind::Ipc),
            "tcp" | "zmq_tcp" => Some(TransportKind::Tcp),
            "fieldbus" | "opcua" => Some(TransportKind::Fieldbus),
            "channel" => Some(TransportKind::Channel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Ipc => "ipc",
            TransportKind::Tcp => "tcp",
            TransportKind::Fieldbus => "fieldbus",
            TransportKind::Channel => "channel",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IPC transport configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct IpcConfig {
    /// Directory holding one socket file per topic or service.
    pub socket_dir: PathBuf,
    /// Per-name socket file overrides.
    pub socket_files: HashMap<String, String>,
    pub recv_hwm: usize,
}

impl IpcConfig {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            socket_files: HashMap::new(),
            recv_hwm: DEFAULT_RECV_HWM,
        }
    }

    /// Socket path for a topic or service name.
    ///
    /// Returns `None` unless the socket file is a single plain path
    /// component, so no name can resolve outside `socket_dir`.
    pub fn socket_path(&self, name: &str) -> Option<PathBuf> {
        let file = self
            .socket_files
            .get(name)
            .map(String::as_str)
            .unwrap_or(name);
        let mut components = Path::new(file).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Some(self.socket_dir.join(file)),
            _ => None,
        }
    }
}

/// A host/port pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Get the socket address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// TCP transport configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpConfig {
    /// Endpoint used by every name without an override.
    pub default: HostPort,
    /// Per-name endpoint overrides.
    pub endpoints: HashMap<String, HostPort>,
    pub recv_hwm: usize,
}

impl TcpConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            default: HostPort::new(host, port),
            endpoints: HashMap::new(),
            recv_hwm: DEFAULT_RECV_HWM,
        }
    }

    /// Endpoint for a topic or service name.
    pub fn endpoint(&self, name: &str) -> &HostPort {
        self.endpoints.get(name).unwrap_or(&self.default)
    }
}

/// Field-bus transport configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldbusConfig {
    /// Endpoint URL template, e.g. `opcua://localhost:{port}/edgebus`.
    pub endpoint: String,
    pub port: u16,
    pub recv_hwm: usize,
}

impl FieldbusConfig {
    /// Endpoint URL with the port substituted.
    pub fn url(&self) -> String {
        self.endpoint.replace(PORT_PLACEHOLDER, &self.port.to_string())
    }

    /// Host and port addressed by the endpoint URL.
    pub fn host_port(&self) -> Result<HostPort, ConfigError> {
        let url = self.url();
        let rest = match url.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() => rest,
            _ => return Err(ConfigError::invalid("endpoint", "expected <scheme>://<host>")),
        };
        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(ConfigError::invalid("endpoint", "missing host"));
        }

        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            let (host, tail) = v6
                .split_once(']')
                .ok_or_else(|| ConfigError::invalid("endpoint", "unterminated IPv6 host"))?;
            (host, tail.strip_prefix(':'))
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|e| ConfigError::invalid("endpoint", format!("bad port '{}': {}", p, e)))?,
            None => self.port,
        };

        Ok(HostPort::new(host, port))
    }
}

/// In-process channel transport configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub recv_hwm: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            recv_hwm: DEFAULT_RECV_HWM,
        }
    }
}

/// Validated transport configuration (discriminated union).
#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    Ipc(IpcConfig),
    Tcp(TcpConfig),
    Fieldbus(FieldbusConfig),
    Channel(ChannelConfig),
}

impl TransportConfig {
    /// Validate a configuration mapping.
    ///
    /// Unknown keys are ignored. Missing required keys fail with
    /// [`ConfigError::MissingKey`]; an unknown discriminator fails with
    /// [`ConfigError::UnsupportedTransport`].
    pub fn from_mapping(mapping: &JsonValue) -> Result<Self, ConfigError> {
        let map = mapping.as_object().ok_or(ConfigError::NotAMapping)?;

        let type_name = require_str(map, TYPE_KEY)?;
        let kind = TransportKind::parse(type_name)
            .ok_or_else(|| ConfigError::UnsupportedTransport(type_name.to_string()))?;
        let recv_hwm = recv_hwm(map)?;

        let config = match kind {
            TransportKind::Ipc => {
                let socket_dir = require_str(map, "socket_dir")?;
                if socket_dir.is_empty() {
                    return Err(ConfigError::invalid("socket_dir", "must not be empty"));
                }
                let mut socket_files = HashMap::new();
                for (name, entry) in named_entries(map) {
                    if let Some(file) = entry.get("socket_file") {
                        let file = file.as_str().ok_or_else(|| {
                            ConfigError::invalid(format!("{}.socket_file", name), "expected a string")
                        })?;
                        socket_files.insert(name.clone(), file.to_string());
                    }
                }
                TransportConfig::Ipc(IpcConfig {
                    socket_dir: PathBuf::from(socket_dir),
                    socket_files,
                    recv_hwm,
                })
            }
            TransportKind::Tcp => {
                let default = HostPort::new(require_str(map, "host")?, require_port(map, "port", "port")?);
                let mut endpoints = HashMap::new();
                for (name, entry) in named_entries(map) {
                    if !entry.contains_key("host") && !entry.contains_key("port") {
                        continue;
                    }
                    let host = entry
                        .get("host")
                        .ok_or_else(|| ConfigError::MissingKey(format!("{}.host", name)))?
                        .as_str()
                        .ok_or_else(|| ConfigError::invalid(format!("{}.host", name), "expected a string"))?;
                    let port = require_port(entry, "port", &format!("{}.port", name))?;
                    endpoints.insert(name.clone(), HostPort::new(host, port));
                }
                TransportConfig::Tcp(TcpConfig {
                    default,
                    endpoints,
                    recv_hwm,
                })
            }
            TransportKind::Fieldbus => {
                let config = FieldbusConfig {
                    endpoint: require_str(map, "endpoint")?.to_string(),
                    port: require_port(map, "port", "port")?,
                    recv_hwm,
                };
                // Surface a malformed endpoint now rather than at first bind.
                config.host_port()?;
                TransportConfig::Fieldbus(config)
            }
            TransportKind::Channel => TransportConfig::Channel(ChannelConfig { recv_hwm }),
        };

        Ok(config)
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Ipc(_) => TransportKind::Ipc,
            TransportConfig::Tcp(_) => TransportKind::Tcp,
            TransportConfig::Fieldbus(_) => TransportKind::Fieldbus,
            TransportConfig::Channel(_) => TransportKind::Channel,
        }
    }

    pub fn recv_hwm(&self) -> usize {
        match self {
            TransportConfig::Ipc(c) => c.recv_hwm,
            TransportConfig::Tcp(c) => c.recv_hwm,
            TransportConfig::Fieldbus(c) => c.recv_hwm,
            TransportConfig::Channel(c) => c.recv_hwm,
        }
    }
}

fn require_str<'a>(map: &'a Map<String, JsonValue>, key: &str) -> Result<&'a str, ConfigError> {
    map.get(key)
        .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?
        .as_str()
        .ok_or_else(|| ConfigError::invalid(key, "expected a string"))
}

fn require_port(map: &Map<String, JsonValue>, key: &str, label: &str) -> Result<u16, ConfigError> {
    let value = map
        .get(key)
        .ok_or_else(|| ConfigError::MissingKey(label.to_string()))?;
    let port = match value {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    port.and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| ConfigError::invalid(label, format!("expected a port number, got {}", value)))
}

fn recv_hwm(map: &Map<String, JsonValue>) -> Result<usize, ConfigError> {
    for key in RECV_HWM_KEYS {
        if let Some(value) = map.get(key) {
            return value
                .as_u64()
                .filter(|n| *n > 0)
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| ConfigError::invalid(key, "expected a positive integer"));
        }
    }
    Ok(DEFAULT_RECV_HWM)
}

/// Per-name sub-mappings (e.g. `"camera": {"host": ..., "port": ...}`).
fn named_entries(map: &Map<String, JsonValue>) -> impl Iterator<Item = (&String, &Map<String, JsonValue>)> {
    map.iter()
        .filter_map(|(name, value)| value.as_object().map(|entry| (name, entry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ipc() {
        let config = TransportConfig::from_mapping(&json!({
            "type": "zmq_ipc",
            "socket_dir": "/tmp/socks",
            "camera": {"socket_file": "cam.sock"},
            "unrelated": 5
        }))
        .unwrap();

        let TransportConfig::Ipc(ipc) = config else {
            panic!("expected ipc config");
        };
        assert_eq!(ipc.socket_path("camera"), Some(PathBuf::from("/tmp/socks/cam.sock")));
        assert_eq!(ipc.socket_path("other"), Some(PathBuf::from("/tmp/socks/other")));
        assert_eq!(ipc.recv_hwm, DEFAULT_RECV_HWM);
    }

    #[test]
    fn test_ipc_socket_path_stays_in_socket_dir() {
        let mut ipc = IpcConfig::new("/tmp/socks");
        ipc.socket_files.insert("escape".to_string(), "../cam.sock".to_string());

        assert_eq!(ipc.socket_path("sensors.temp"), Some(PathBuf::from("/tmp/socks/sensors.temp")));
        assert_eq!(ipc.socket_path("../x"), None);
        assert_eq!(ipc.socket_path("/etc/x"), None);
        assert_eq!(ipc.socket_path("a/b"), None);
        assert_eq!(ipc.socket_path(".."), None);
        assert_eq!(ipc.socket_path("escape"), None);
    }

    #[test]
    fn test_parse_tcp_with_overrides() {
        let config = TransportConfig::from_mapping(&json!({
            "type": "tcp",
            "host": "127.0.0.1",
            "port": 5569,
            "camera": {"host": "10.0.0.4", "port": "5570"},
            "zmq_recv_hwm": 50
        }))
        .unwrap();

        let TransportConfig::Tcp(tcp) = config else {
            panic!("expected tcp config");
        };
        assert_eq!(tcp.endpoint("camera").addr(), "10.0.0.4:5570");
        assert_eq!(tcp.endpoint("anything").addr(), "127.0.0.1:5569");
        assert_eq!(tcp.recv_hwm, 50);
    }

    #[test]
    fn test_parse_tcp_partial_override_names_missing_key() {
        let err = TransportConfig::from_mapping(&json!({
            "type": "tcp",
            "host": "127.0.0.1",
            "port": 5569,
            "camera": {"host": "10.0.0.4"}
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(k) if k == "camera.port"));
    }

    #[test]
    fn test_missing_type() {
        let err = TransportConfig::from_mapping(&json!({"socket_dir": "/tmp"})).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(k) if k == "type"));
    }

    #[test]
    fn test_missing_required_key_is_named() {
        let err = TransportConfig::from_mapping(&json!({"type": "tcp", "host": "localhost"})).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(k) if k == "port"));

        let err = TransportConfig::from_mapping(&json!({"type": "ipc"})).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(k) if k == "socket_dir"));
    }

    #[test]
    fn test_unsupported_transport() {
        let err = TransportConfig::from_mapping(&json!({"type": "carrier_pigeon"})).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedTransport(t) if t == "carrier_pigeon"));
    }

    #[test]
    fn test_not_a_mapping() {
        let err = TransportConfig::from_mapping(&json!(["ipc"])).unwrap_err();
        assert!(matches!(err, ConfigError::NotAMapping));
    }

    #[test]
    fn test_invalid_port() {
        let err = TransportConfig::from_mapping(&json!({"type": "tcp", "host": "h", "port": 70000}))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "port"));
    }

    #[test]
    fn test_invalid_recv_hwm() {
        let err = TransportConfig::from_mapping(&json!({"type": "channel", "recv_hwm": 0})).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "recv_hwm"));
    }

    #[test]
    fn test_parse_fieldbus() {
        let config = TransportConfig::from_mapping(&json!({
            "type": "opcua",
            "endpoint": "opcua://localhost:{port}/edgebus",
            "port": 4840
        }))
        .unwrap();

        let TransportConfig::Fieldbus(fb) = config else {
            panic!("expected fieldbus config");
        };
        assert_eq!(fb.url(), "opcua://localhost:4840/edgebus");
        assert_eq!(fb.host_port().unwrap(), HostPort::new("localhost", 4840));
    }

    #[test]
    fn test_fieldbus_endpoint_without_port_uses_configured_port() {
        let config = FieldbusConfig {
            endpoint: "opc.tcp://[::1]/bus".to_string(),
            port: 4841,
            recv_hwm: DEFAULT_RECV_HWM,
        };
        assert_eq!(config.host_port().unwrap(), HostPort::new("::1", 4841));
    }

    #[test]
    fn test_fieldbus_malformed_endpoint() {
        let err = TransportConfig::from_mapping(&json!({
            "type": "fieldbus",
            "endpoint": "localhost:4840",
            "port": 4840
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "endpoint"));
    }

    #[test]
    fn test_kind_aliases() {
        assert_eq!(TransportKind::parse("zmq_tcp"), Some(TransportKind::Tcp));
        assert_eq!(TransportKind::parse("opcua"), Some(TransportKind::Fieldbus));
        assert_eq!(TransportKind::parse("channel"), Some(TransportKind::Channel));
        assert_eq!(TransportKind::parse("amqp"), None);
    }
}
