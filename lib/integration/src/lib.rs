//! Credentials handed to nodes at execution time.
//!
//! The engine never stores or decrypts secrets itself. It asks a
//! [`CredentialResolver`] for the bundle belonging to a node right before
//! the node runs.

pub mod credential;
pub mod error;

pub use credential::{
    CredentialBundle, CredentialData, CredentialResolver, CredentialType, NoCredentials,
    StaticCredentialResolver,
};
pub use error::CredentialError;
