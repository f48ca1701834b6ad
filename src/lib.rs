//! OAuth 2.1 proxy core for servers that aggregate remote tool endpoints on
//! behalf of authenticated end users.
//!
//! When a remote server answers `401 Unauthorized` with a
//! `WWW-Authenticate: Bearer` challenge, this crate drives the three-legged
//! authorization-code flow (always PKCE S256) against the advertised identity
//! provider, keeps the resulting tokens in memory keyed by
//! `(session, issuer, scope)`, and hands them back out as bearer credentials —
//! reusing a token across remote servers that share an issuer. It also
//! performs RFC 8693 token exchange for cross-cluster single sign-on.
//!
//! The entry point is [`OAuthProxy`]: the embedding server constructs one per
//! configuration, mounts [`OAuthProxy::router`] for the callback and
//! client-metadata endpoints, and calls [`OAuthProxy::get_token`] /
//! [`OAuthProxy::create_auth_challenge`] from its request path. All state is
//! RAM-resident; nothing survives a restart.

use std::time::Duration;

pub mod challenge;
pub mod client;
pub mod config;
mod error;
pub mod exchange;
mod http;
mod manager;
pub mod secret;
pub mod store;

#[cfg(test)]
mod tests;

pub use challenge::BearerChallenge;
pub use client::{AuthServerMetadata, OAuthClient};
pub use config::ProxyConfig;
pub use error::AuthProxyError;
pub use exchange::{ExchangeCacheStats, ExchangedToken, TokenExchangeConfig, TokenExchanger};
pub use manager::{AuthChallenge, AuthCompletionCallback, OAuthProxy, ServerBinding};
pub use secret::Secret;
pub use store::token::{Token, TokenKey};

/// Clock-skew margin applied to every token-expiry comparison.
///
/// A token whose absolute expiry lies less than this far in the future is
/// treated as expired on the read path and as refresh-due on the proactive
/// refresh path.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(30);
