//! Relay connection roles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Direction of traffic on a relay connection, seen from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    /// Server only receives frames; the connection ends when the client leaves.
    Inbound,
    /// Server only pushes frames; reads exist solely to notice disconnects.
    Outbound,
    /// Both directions.
    Duplex,
}

impl ConnectionRole {
    /// Whether frames read from the client are handed to the application.
    pub fn receives(&self) -> bool {
        matches!(self, Self::Inbound | Self::Duplex)
    }

    /// Whether the connection is registered for relay pushes.
    pub fn sends(&self) -> bool {
        matches!(self, Self::Outbound | Self::Duplex)
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
            Self::Duplex => write!(f, "duplex"),
        }
    }
}

impl FromStr for ConnectionRole {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            "duplex" => Ok(Self::Duplex),
            other => Err(DomainError::UnknownRole(other.to_string())),
        }
    }
}
