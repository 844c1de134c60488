//! Core domain types shared across the klikkflow workspace.
//!
//! Provides strongly typed identifiers and the `rootcause` based `Result`
//! alias used at crate boundaries.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{CredentialId, ExecutionId, ParseIdError, WorkflowId};
