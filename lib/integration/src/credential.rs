//! Credential bundles and the resolver interface.
//!
//! Secret material never appears in `Debug` output, so bundles can be
//! carried through traced code paths safely.

use crate::error::CredentialError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// The type of credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    /// OAuth 2.0 tokens.
    Oauth2,
    /// API key.
    ApiKey,
    /// Username and password.
    BasicAuth,
    /// Bearer token.
    BearerToken,
    /// Custom credential format.
    Custom,
}

/// Decrypted credential data.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialData {
    /// OAuth 2.0 tokens.
    Oauth2 {
        access_token: String,
        refresh_token: Option<String>,
        token_type: String,
        expires_at: Option<DateTime<Utc>>,
        scope: Option<String>,
    },
    /// API key.
    ApiKey {
        key: String,
        header_name: Option<String>,
    },
    /// Basic authentication.
    BasicAuth { username: String, password: String },
    /// Bearer token.
    BearerToken { token: String },
    /// Custom credential data.
    Custom { data: serde_json::Value },
}

impl CredentialData {
    /// Creates OAuth2 credential data.
    #[must_use]
    pub fn oauth2(access_token: impl Into<String>) -> Self {
        Self::Oauth2 {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_at: None,
            scope: None,
        }
    }

    /// Creates API key credential data.
    #[must_use]
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey {
            key: key.into(),
            header_name: None,
        }
    }

    /// Creates basic auth credential data.
    #[must_use]
    pub fn basic_auth(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::BasicAuth {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Returns the credential type.
    #[must_use]
    pub fn credential_type(&self) -> CredentialType {
        match self {
            Self::Oauth2 { .. } => CredentialType::Oauth2,
            Self::ApiKey { .. } => CredentialType::ApiKey,
            Self::BasicAuth { .. } => CredentialType::BasicAuth,
            Self::BearerToken { .. } => CredentialType::BearerToken,
            Self::Custom { .. } => CredentialType::Custom,
        }
    }
}

impl fmt::Debug for CredentialData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialData")
            .field("type", &self.credential_type())
            .finish_non_exhaustive()
    }
}

/// The credentials available to one node, keyed by the name the node
/// refers to them by (for example `smtp` or `openai`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialBundle {
    entries: BTreeMap<String, CredentialData>,
}

impl CredentialBundle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named credential.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, data: CredentialData) -> Self {
        self.entries.insert(name.into(), data);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CredentialData> {
        self.entries.get(name)
    }

    /// Looks up a credential a node cannot run without.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::NotFound`] when the name is not bound.
    pub fn require(&self, node_id: &str, name: &str) -> Result<&CredentialData, CredentialError> {
        self.get(name).ok_or_else(|| CredentialError::NotFound {
            node_id: node_id.to_string(),
            name: name.to_string(),
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Resolves the credentials injected into a node's execution.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Returns the bundle for the given node. Nodes without credentials
    /// get an empty bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret store fails or holds invalid data.
    async fn resolve_credentials(&self, node_id: &str) -> Result<CredentialBundle, CredentialError>;
}

/// Resolver for workflows that use no credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialResolver for NoCredentials {
    async fn resolve_credentials(&self, _node_id: &str) -> Result<CredentialBundle, CredentialError> {
        Ok(CredentialBundle::new())
    }
}

/// Resolver backed by a fixed node id to bundle map, e.g. loaded from a
/// local secrets file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticCredentialResolver {
    bundles: HashMap<String, CredentialBundle>,
}

impl StaticCredentialResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a bundle to a node.
    #[must_use]
    pub fn with_node(mut self, node_id: impl Into<String>, bundle: CredentialBundle) -> Self {
        self.bundles.insert(node_id.into(), bundle);
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve_credentials(&self, node_id: &str) -> Result<CredentialBundle, CredentialError> {
        Ok(self.bundles.get(node_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_types() {
        assert_eq!(
            CredentialData::oauth2("token").credential_type(),
            CredentialType::Oauth2
        );
        assert_eq!(
            CredentialData::api_key("key").credential_type(),
            CredentialType::ApiKey
        );
        assert_eq!(
            CredentialData::basic_auth("user", "pass").credential_type(),
            CredentialType::BasicAuth
        );
    }

    #[test]
    fn debug_output_hides_secrets() {
        let bundle = CredentialBundle::new().with("smtp", CredentialData::basic_auth("ops", "hunter2"));
        let debug = format!("{bundle:?}");
        assert!(debug.contains("smtp"));
        assert!(debug.contains("BasicAuth"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn bundle_serde_roundtrip() {
        let bundle = CredentialBundle::new()
            .with("api", CredentialData::api_key("k-1"))
            .with("oauth", CredentialData::oauth2("at"));
        let json = serde_json::to_value(&bundle).expect("serialize");
        assert_eq!(json["api"]["type"], "api_key");
        let parsed: CredentialBundle = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, bundle);
    }

    #[test]
    fn require_reports_missing_name() {
        let err = CredentialBundle::new().require("mailer", "smtp").unwrap_err();
        assert_eq!(
            err,
            CredentialError::NotFound {
                node_id: "mailer".to_string(),
                name: "smtp".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn static_resolver_returns_bound_bundle_or_empty() {
        let resolver = StaticCredentialResolver::new().with_node(
            "mailer",
            CredentialBundle::new().with("smtp", CredentialData::basic_auth("u", "p")),
        );
        let bound = resolver.resolve_credentials("mailer").await.expect("resolve");
        assert!(bound.get("smtp").is_some());
        let unbound = resolver.resolve_credentials("other").await.expect("resolve");
        assert!(unbound.is_empty());
    }
}
