//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Room or relay path is not usable as a broadcast domain
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// Unknown connection role name
    #[error("Unknown connection role: {0} (expected inbound, outbound or duplex)")]
    UnknownRole(String),
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
