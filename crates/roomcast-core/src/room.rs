//! Room names.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Name of a broadcast domain.
///
/// A room is named after the URL path it was reached through, so
/// `/lobby` and `/lobby/` are different rooms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName(String);

impl RoomName {
    /// Builds a room name from a request path.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidPath` if the path is empty or does not
    /// start with `/`.
    pub fn from_path(path: impl Into<String>) -> DomainResult<Self> {
        let path = path.into();
        validate_path(&path)?;
        Ok(Self(path))
    }

    /// Returns the underlying path.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Checks that a string can serve as a room or relay path.
pub fn validate_path(path: &str) -> DomainResult<()> {
    if path.is_empty() {
        return Err(DomainError::InvalidPath {
            path: path.to_string(),
            reason: "path is empty".to_string(),
        });
    }
    if !path.starts_with('/') {
        return Err(DomainError::InvalidPath {
            path: path.to_string(),
            reason: "path must start with '/'".to_string(),
        });
    }
    Ok(())
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for RoomName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_path(value)
    }
}

impl From<RoomName> for String {
    fn from(name: RoomName) -> Self {
        name.0
    }
}

impl AsRef<str> for RoomName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
