//! Daemon configuration.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration. Values are loaded from TOML:
//!
//! ```toml
//! listen = "0.0.0.0:8080"
//!
//! [broker]
//! idle_timeout_secs = 10
//! echo_suppression = true
//!
//! [[relay.endpoints]]
//! path = "/feed"
//! role = "outbound"
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::role::ConnectionRole;
use crate::room::validate_path;

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

/// Paths served by the daemon itself; relay endpoints may not use them.
pub const RESERVED_PATHS: [&str; 2] = ["/liveness", "/readiness"];

/// Prefix of the HTTP push endpoint.
pub const PUSH_PREFIX: &str = "/push";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the HTTP/WebSocket server binds to
    pub listen: String,

    /// Room broker settings
    pub broker: BrokerConfig,

    /// Multi-path relay settings
    pub relay: RelayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            broker: BrokerConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

/// Room broker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// How long a room may sit empty before it is cleaned up
    pub idle_timeout_secs: u64,

    /// Per-connection outbound queue size; a full queue gets the member evicted
    pub outbound_capacity: usize,

    /// Per-room inbound message queue size
    pub inbound_capacity: usize,

    /// Process-wide registration queue size
    pub registration_capacity: usize,

    /// Upper bound on waiting for a room to accept a join
    pub join_timeout_secs: u64,

    /// Skip the sender when fanning out its own message
    pub echo_suppression: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 10,
            outbound_capacity: 100,
            inbound_capacity: 1000,
            registration_capacity: 100,
            join_timeout_secs: 5,
            echo_suppression: true,
        }
    }
}

impl BrokerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

/// Multi-path relay settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Per-connection outbound queue size
    pub outbound_capacity: usize,

    /// Per-connection queue for frames handed to the application
    pub inbound_capacity: usize,

    /// Relay actor command queue size (registrations and pushes)
    pub command_capacity: usize,

    /// Only accept relay upgrades whose `Origin` header equals this value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_origin: Option<String>,

    /// WebSocket endpoints served by the relay
    pub endpoints: Vec<RelayEndpointConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 100,
            inbound_capacity: 100,
            command_capacity: 100,
            allowed_origin: None,
            endpoints: Vec::new(),
        }
    }
}

/// One relay WebSocket endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayEndpointConfig {
    /// Exact URL path of the endpoint; also the relay path pushes target
    pub path: String,

    /// Traffic direction
    pub role: ConnectionRole,

    /// Relay path that frames received on this endpoint are pushed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_to: Option<String>,
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid listen address '{addr}': {error}")]
    InvalidListen { addr: String, error: String },

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl Config {
    /// Reads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Self::from_toml_str(&contents)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parses the listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidListen {
                addr: self.listen.clone(),
                error: e.to_string(),
            })
    }

    /// Checks value ranges and endpoint paths.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;

        let broker = &self.broker;
        if broker.idle_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "broker.idle_timeout_secs",
                "must be positive",
            ));
        }
        if broker.join_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "broker.join_timeout_secs",
                "must be positive",
            ));
        }
        for (field, value) in [
            ("broker.outbound_capacity", broker.outbound_capacity),
            ("broker.inbound_capacity", broker.inbound_capacity),
            ("broker.registration_capacity", broker.registration_capacity),
            ("relay.outbound_capacity", self.relay.outbound_capacity),
            ("relay.inbound_capacity", self.relay.inbound_capacity),
            ("relay.command_capacity", self.relay.command_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be positive"));
            }
        }

        if self
            .relay
            .allowed_origin
            .as_deref()
            .is_some_and(|origin| origin.trim().is_empty())
        {
            return Err(ConfigError::invalid(
                "relay.allowed_origin",
                "must not be empty",
            ));
        }

        let mut seen = HashSet::new();
        for endpoint in &self.relay.endpoints {
            validate_path(&endpoint.path)
                .map_err(|e| ConfigError::invalid("relay.endpoints.path", e.to_string()))?;
            if let Some(problem) = route_syntax(&endpoint.path) {
                return Err(ConfigError::invalid(
                    "relay.endpoints.path",
                    format!("{} {problem}", endpoint.path),
                ));
            }
            if is_reserved(&endpoint.path) {
                return Err(ConfigError::invalid(
                    "relay.endpoints.path",
                    format!("{} is reserved", endpoint.path),
                ));
            }
            if !seen.insert(endpoint.path.as_str()) {
                return Err(ConfigError::invalid(
                    "relay.endpoints.path",
                    format!("duplicate endpoint {}", endpoint.path),
                ));
            }
            if let Some(target) = &endpoint.forward_to {
                validate_path(target).map_err(|e| {
                    ConfigError::invalid("relay.endpoints.forward_to", e.to_string())
                })?;
                if !endpoint.role.receives() {
                    return Err(ConfigError::invalid(
                        "relay.endpoints.forward_to",
                        format!(
                            "{} endpoint {} never receives frames",
                            endpoint.role, endpoint.path
                        ),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Endpoint paths become exact router routes, so anything the router would
/// read as a capture or wildcard is refused here.
fn route_syntax(path: &str) -> Option<&'static str> {
    if path.contains(|c: char| c == '{' || c == '}') {
        return Some("contains route parameter braces");
    }
    if path
        .split('/')
        .any(|segment| segment.starts_with(':') || segment.starts_with('*'))
    {
        return Some("has a segment starting with ':' or '*'");
    }
    None
}

fn is_reserved(path: &str) -> bool {
    RESERVED_PATHS.contains(&path)
        || path == PUSH_PREFIX
        || path.starts_with(&format!("{PUSH_PREFIX}/"))
}
