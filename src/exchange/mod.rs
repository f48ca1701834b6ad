//! RFC 8693 token exchange for cross-cluster single sign-on.
//!
//! A locally-valid subject token (normally the user's ID token) is traded
//! at a foreign cluster's token endpoint for an access token valid there.
//! Exchanged tokens are cached per `(endpoint, connector, user)` and the
//! issuer claim of the returned token is verified — in constant time —
//! against the expected issuer as defense in depth against a misdirected
//! or compromised endpoint.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::{error::AuthProxyError, secret::Secret};

mod cache;

pub use cache::{DEFAULT_MAX_ENTRIES, ExchangeCacheStats};

use cache::{ExchangeCache, ExchangeKey};

const GRANT_TYPE_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const TOKEN_TYPE_ACCESS_TOKEN: &str = "urn:ietf:params:oauth:token-type:access_token";
const TOKEN_TYPE_ID_TOKEN: &str = "urn:ietf:params:oauth:token-type:id_token";
const DEFAULT_SCOPES: &str = "openid profile email groups";

/// Per-target token exchange configuration, supplied by the collaborator
/// that knows about the remote cluster.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenExchangeConfig {
    /// Exchange switch for this target.
    #[serde(default)]
    pub enabled: bool,

    /// Token endpoint of the foreign authorization server. Must be HTTPS.
    #[serde(default)]
    pub endpoint: String,

    /// Upstream connector the foreign server should map the subject
    /// through (a Dex concept, carried verbatim).
    #[serde(default)]
    pub connector_id: String,

    /// Issuer expected in the exchanged token. Must be HTTPS when set.
    /// When unset it is derived from the endpoint by stripping `/token`.
    #[serde(default)]
    pub expected_issuer: Option<String>,

    /// Client credentials, when the foreign server requires them.
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<Secret>,

    /// Scopes to request. Defaults to `openid profile email groups`.
    #[serde(default)]
    pub scopes: Option<String>,

    /// Subject token type. Defaults to the ID-token URN.
    #[serde(default)]
    pub subject_token_type: Option<String>,
}

/// Result of a token exchange.
#[derive(Debug, Clone)]
pub struct ExchangedToken {
    pub access_token: Secret,
    pub issued_token_type: String,
    pub token_type: String,
    /// Whether this result was served from the cache.
    pub from_cache: bool,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    access_token: Secret,
    #[serde(default)]
    issued_token_type: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// RFC 8693 client with its own expiring result cache.
pub struct TokenExchanger {
    http: reqwest::Client,
    cache: ExchangeCache,
}

impl TokenExchanger {
    /// Create an exchanger sharing `http` (and therefore its TLS trust)
    /// with the rest of the proxy.
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_capacity(http, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(http: reqwest::Client, max_entries: usize) -> Self {
        Self {
            http,
            cache: ExchangeCache::new(max_entries),
        }
    }

    /// Exchange `subject_token` for an access token on the configured
    /// foreign cluster.
    ///
    /// `user_id` must be the validated `sub` claim of the subject token —
    /// callers derive it from JWT validation, never from request headers
    /// or URL parameters — because it is part of the cache key that
    /// isolates users from each other.
    pub async fn exchange(
        &self,
        subject_token: &Secret,
        user_id: &str,
        config: &TokenExchangeConfig,
    ) -> Result<ExchangedToken, AuthProxyError> {
        self.exchange_with_client(&self.http, subject_token, user_id, config)
            .await
    }

    /// Like [`exchange`](Self::exchange) with a caller-supplied HTTP
    /// client (mTLS through a proxy, alternative trust roots). The result
    /// cache is shared with the default path.
    pub async fn exchange_with_client(
        &self,
        http: &reqwest::Client,
        subject_token: &Secret,
        user_id: &str,
        config: &TokenExchangeConfig,
    ) -> Result<ExchangedToken, AuthProxyError> {
        validate_request(subject_token, user_id, config)?;
        self.perform_exchange(http, subject_token, user_id, config)
            .await
    }

    /// The wire flow, after input validation has passed.
    async fn perform_exchange(
        &self,
        http: &reqwest::Client,
        subject_token: &Secret,
        user_id: &str,
        config: &TokenExchangeConfig,
    ) -> Result<ExchangedToken, AuthProxyError> {
        let key = ExchangeKey {
            endpoint: config.endpoint.clone(),
            connector_id: config.connector_id.clone(),
            user_id: user_id.to_string(),
        };
        if let Some((access_token, issued_token_type, token_type)) = self.cache.get(&key) {
            tracing::debug!(endpoint = %config.endpoint, "token exchange served from cache");
            return Ok(ExchangedToken {
                access_token,
                issued_token_type,
                token_type,
                from_cache: true,
            });
        }

        let subject_token_type = config
            .subject_token_type
            .as_deref()
            .unwrap_or(TOKEN_TYPE_ID_TOKEN);
        let scope = config.scopes.as_deref().unwrap_or(DEFAULT_SCOPES);

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("subject_token", subject_token.value()),
            ("subject_token_type", subject_token_type),
            ("connector_id", &config.connector_id),
            ("scope", scope),
            ("requested_token_type", TOKEN_TYPE_ACCESS_TOKEN),
        ];
        if !config.client_id.is_empty() {
            form.push(("client_id", &config.client_id));
        }
        if let Some(client_secret) = &config.client_secret {
            if !client_secret.is_empty() {
                form.push(("client_secret", client_secret.value()));
            }
        }

        let response = http.post(&config.endpoint).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(%status, body = %body, endpoint = %config.endpoint, "token exchange rejected");
            return Err(AuthProxyError::TokenEndpoint { status });
        }
        let parsed: ExchangeResponse = response.json().await?;

        let expected = expected_issuer(config);
        if !expected.is_empty() {
            verify_issuer_claim(&parsed.access_token, &expected)?;
        }

        let expires_in = parsed.expires_in.unwrap_or(0);
        if expires_in > 0 {
            self.cache.insert(
                key,
                parsed.access_token.clone(),
                parsed.issued_token_type.clone(),
                parsed.token_type.clone(),
                Duration::from_secs(expires_in),
            );
        }

        tracing::debug!(endpoint = %config.endpoint, expires_in, "token exchange completed");
        Ok(ExchangedToken {
            access_token: parsed.access_token,
            issued_token_type: parsed.issued_token_type,
            token_type: parsed.token_type,
            from_cache: false,
        })
    }

    /// Drop expired cache entries.
    pub fn cleanup(&self) {
        self.cache.cleanup();
    }

    /// Forget one cached exchange result.
    pub fn clear_cache(&self, endpoint: &str, connector_id: &str, user_id: &str) {
        self.cache.clear(&ExchangeKey {
            endpoint: endpoint.to_string(),
            connector_id: connector_id.to_string(),
            user_id: user_id.to_string(),
        });
    }

    pub fn clear_all(&self) {
        self.cache.clear_all();
    }

    pub fn cache_stats(&self) -> ExchangeCacheStats {
        self.cache.stats()
    }
}

/// Reject bad requests before any I/O happens.
fn validate_request(
    subject_token: &Secret,
    user_id: &str,
    config: &TokenExchangeConfig,
) -> Result<(), AuthProxyError> {
    if !config.enabled {
        return Err(AuthProxyError::InvalidInput(
            "token exchange is not enabled for this target".to_string(),
        ));
    }
    if subject_token.is_empty() {
        return Err(AuthProxyError::InvalidInput(
            "subject token is required".to_string(),
        ));
    }
    if config.endpoint.is_empty() {
        return Err(AuthProxyError::InvalidInput(
            "token exchange endpoint is required".to_string(),
        ));
    }
    if !config.endpoint.starts_with("https://") {
        return Err(AuthProxyError::InvalidInput(format!(
            "token exchange endpoint must use https, got {}",
            config.endpoint
        )));
    }
    if config.connector_id.is_empty() {
        return Err(AuthProxyError::InvalidInput(
            "connector_id is required".to_string(),
        ));
    }
    if user_id.is_empty() {
        return Err(AuthProxyError::InvalidInput(
            "user_id is required".to_string(),
        ));
    }
    if let Some(expected) = &config.expected_issuer {
        if !expected.starts_with("https://") {
            return Err(AuthProxyError::InvalidInput(format!(
                "expected_issuer must use https, got {expected}"
            )));
        }
    }
    Ok(())
}

/// The issuer the exchanged token must have been minted by.
fn expected_issuer(config: &TokenExchangeConfig) -> String {
    match &config.expected_issuer {
        Some(expected) => expected.trim_end_matches('/').to_string(),
        None => {
            let endpoint = config.endpoint.trim_end_matches('/');
            let endpoint = endpoint.strip_suffix("/token").unwrap_or(endpoint);
            endpoint.trim_end_matches('/').to_string()
        }
    }
}

/// Verify the `iss` claim of a JWT-shaped access token against `expected`.
///
/// Opaque (non-JWT) tokens pass: there is no claim to check and downstream
/// servers do full validation. The comparison runs in constant time.
fn verify_issuer_claim(access_token: &Secret, expected: &str) -> Result<(), AuthProxyError> {
    let parts: Vec<&str> = access_token.value().split('.').collect();
    if parts.len() != 3 {
        return Ok(());
    }

    let Ok(payload) = URL_SAFE_NO_PAD.decode(parts[1].as_bytes()) else {
        tracing::debug!("exchanged token looks like a jwt but its payload is not base64url");
        return Ok(());
    };
    let Ok(claims) = serde_json::from_slice::<serde_json::Value>(&payload) else {
        tracing::debug!("exchanged token payload is not json");
        return Ok(());
    };
    let Some(issuer) = claims.get("iss").and_then(|iss| iss.as_str()) else {
        tracing::debug!("exchanged token carries no iss claim");
        return Ok(());
    };

    let actual = issuer.trim_end_matches('/');
    let matches: bool = actual.as_bytes().ct_eq(expected.as_bytes()).into();
    if !matches {
        return Err(AuthProxyError::IssuerMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}
