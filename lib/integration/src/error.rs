//! Error types for credential resolution.

use std::fmt;

/// Errors from resolving a node's credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// The node requires credentials that are not configured.
    NotFound { node_id: String, name: String },
    /// Stored credential data could not be interpreted.
    InvalidFormat { reason: String },
    /// The backing secret store could not be reached.
    Unavailable { reason: String },
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { node_id, name } => {
                write!(f, "credential '{name}' not found for node {node_id}")
            }
            Self::InvalidFormat { reason } => write!(f, "invalid credential format: {reason}"),
            Self::Unavailable { reason } => write!(f, "credential store unavailable: {reason}"),
        }
    }
}

impl std::error::Error for CredentialError {}
