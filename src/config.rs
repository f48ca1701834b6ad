//! Proxy configuration.
//!
//! The embedding server deserializes this from its own configuration file
//! and hands it to [`OAuthProxy::new`](crate::OAuthProxy::new). Defaults
//! follow the usual serde-default-fn pattern so a minimal config is just
//! `enabled: true` plus a `public_url`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::AuthProxyError;

/// Configuration for the OAuth proxy core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Master switch. When false the proxy is a null object: construction
    /// succeeds and every operation is a no-op.
    #[serde(default)]
    pub enabled: bool,

    /// Externally reachable base URL of the embedding server, used to build
    /// the redirect URI (`public_url` + `callback_path`). A trailing slash
    /// is tolerated and stripped.
    #[serde(default)]
    pub public_url: String,

    /// OAuth client identifier. Leave empty to self-host a Client ID
    /// Metadata Document and use its URL as the client id.
    #[serde(default)]
    pub client_id: String,

    /// Human-readable client name, surfaced in the self-hosted metadata
    /// document and on IdP consent screens.
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Route of the authorization-code callback endpoint.
    #[serde(default = "default_callback_path")]
    pub callback_path: String,

    /// Route of the self-hosted Client ID Metadata Document.
    #[serde(default = "default_cimd_path")]
    pub cimd_path: String,

    /// Scopes advertised in the self-hosted metadata document.
    #[serde(default = "default_cimd_scopes")]
    pub cimd_scopes: String,

    /// Optional PEM root certificate. When set, the proxy's HTTP client
    /// trusts only this root (not the system store) for all outbound
    /// calls, including token exchange.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

fn default_client_name() -> String {
    "portcullis".to_string()
}

fn default_callback_path() -> String {
    "/oauth/callback".to_string()
}

fn default_cimd_path() -> String {
    "/.well-known/oauth-client.json".to_string()
}

fn default_cimd_scopes() -> String {
    "openid profile email".to_string()
}

impl ProxyConfig {
    /// Normalize and check the configuration. Run once before use.
    pub fn validate(&mut self) -> Result<(), AuthProxyError> {
        if !self.enabled {
            return Ok(());
        }

        self.public_url = self.public_url.trim_end_matches('/').to_string();
        if self.public_url.is_empty() {
            return Err(AuthProxyError::Config(
                "public_url is required when the oauth proxy is enabled".to_string(),
            ));
        }
        if !self.callback_path.starts_with('/') {
            self.callback_path = format!("/{}", self.callback_path);
        }
        if !self.cimd_path.starts_with('/') {
            self.cimd_path = format!("/{}", self.cimd_path);
        }
        Ok(())
    }

    /// The redirect URI registered with identity providers.
    pub fn redirect_uri(&self) -> String {
        format!("{}{}", self.public_url.trim_end_matches('/'), self.callback_path)
    }

    /// The effective OAuth client id.
    ///
    /// When no client id is configured the proxy self-hosts a Client ID
    /// Metadata Document and, per that convention, the document's own URL
    /// is the client id.
    pub fn effective_client_id(&self) -> String {
        if self.client_id.is_empty() {
            format!("{}{}", self.public_url.trim_end_matches('/'), self.cimd_path)
        } else {
            self.client_id.clone()
        }
    }

    /// Whether the metadata document endpoint should be served.
    pub fn should_serve_cimd(&self) -> bool {
        self.client_id.is_empty()
    }
}
