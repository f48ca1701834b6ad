//! Error type shared across the proxy core.
//!
//! Messages are written to be shown to collaborators and logs: they carry a
//! category and a one-line cause, never token material or IdP response
//! bodies. Anything sensitive is logged at debug level at the call site
//! instead.

use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum AuthProxyError {
    /// The proxy was constructed with `enabled: false` (or not at all).
    /// Collaborators should fall back to anonymous requests.
    #[error("oauth proxy is disabled")]
    Disabled,

    /// A required argument was missing or malformed. The caller fixes its
    /// configuration; nothing was sent on the wire.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The `state` parameter was unknown, expired, or already consumed.
    /// The user should be shown a "session expired" page and a new flow
    /// started.
    #[error("authorization state {0}")]
    StateInvalid(&'static str),

    /// Neither discovery endpoint produced usable metadata.
    #[error(
        "metadata discovery for {issuer} failed: \
         oauth-authorization-server -> {oauth_status}, openid-configuration -> {oidc_status}"
    )]
    MetadataUnavailable {
        issuer: String,
        oauth_status: String,
        oidc_status: String,
    },

    /// A token, refresh, or exchange endpoint answered non-2xx. The body
    /// may contain sensitive detail and is only ever logged at debug, so
    /// the message carries the status alone.
    #[error("token endpoint returned {status}")]
    TokenEndpoint { status: StatusCode },

    /// Outbound request failed before a status was available.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The exchanged token's `iss` claim did not match the expected
    /// issuer. There is no fallback; the message names both sides so the
    /// operator can fix the endpoint or `expected_issuer` configuration.
    #[error(
        "issuer mismatch: token issued by {actual} but expected {expected}; \
         check the exchange endpoint and expected_issuer configuration"
    )]
    IssuerMismatch { expected: String, actual: String },

    /// An internally-bounded operation ran out of time (e.g. a proactive
    /// refresh exceeding its 30-second deadline).
    #[error("operation timed out")]
    Timeout,

    /// No stored token for the requested session and issuer.
    #[error("no token stored for session and issuer")]
    TokenNotFound,

    /// The proxy configuration could not be applied (unreadable CA file,
    /// invalid public URL, ...).
    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_endpoint_error_carries_only_the_status() {
        let err = AuthProxyError::TokenEndpoint {
            status: StatusCode::BAD_GATEWAY,
        };
        let text = err.to_string();
        assert!(text.contains("502"));
        assert!(!text.to_lowercase().contains("body"));
    }

    #[test]
    fn issuer_mismatch_names_both_sides() {
        let err = AuthProxyError::IssuerMismatch {
            expected: "https://dex.cluster.example.com".into(),
            actual: "https://evil.example.com".into(),
        };
        let text = err.to_string();
        assert!(text.contains("https://dex.cluster.example.com"));
        assert!(text.contains("https://evil.example.com"));
    }
}
