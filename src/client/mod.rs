//! OAuth 2.1 client: authorization-URL construction, code exchange, and
//! token refresh.
//!
//! One [`OAuthClient`] serves every issuer the proxy talks to. It owns the
//! token store, the state store, and the metadata cache, plus the HTTP
//! client (optionally pinned to a single root CA) that is shared with the
//! token exchanger.

use std::{
    fs,
    path::Path,
    time::{Duration, Instant},
};

use serde::Deserialize;
use url::Url;

use crate::{
    config::ProxyConfig,
    error::AuthProxyError,
    secret::Secret,
    store::{
        state::StateStore,
        token::{Token, TokenStore},
    },
};

mod flight;
pub mod metadata;
pub mod pkce;

pub use metadata::{AuthServerMetadata, MetadataCache, ProtectedResourceMetadata};
pub use pkce::PkcePair;

use flight::KeyedLocks;

/// Overall deadline for a proactive refresh when the caller brings no
/// tighter one.
const REFRESH_DEADLINE: Duration = Duration::from_secs(30);

/// Token endpoint response (RFC 6749 §5.1). Secret-typed fields parse the
/// raw JSON values but redact on any re-serialization.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Secret,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<Secret>,
    #[serde(default)]
    id_token: Option<Secret>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_token(self, issuer: &str) -> Token {
        let expires_in = self.expires_in.unwrap_or(0);
        Token {
            access_token: self.access_token,
            token_type: if self.token_type.is_empty() {
                "Bearer".to_string()
            } else {
                self.token_type
            },
            refresh_token: self.refresh_token,
            id_token: self.id_token,
            scope: self.scope.unwrap_or_default(),
            issuer: issuer.to_string(),
            expires_in,
            expires_at: (expires_in > 0).then(|| Instant::now() + Duration::from_secs(expires_in)),
        }
    }
}

/// Stateful OAuth client tying the stores and the metadata cache together.
pub struct OAuthClient {
    client_id: String,
    redirect_uri: String,
    http: reqwest::Client,
    tokens: TokenStore,
    states: StateStore,
    metadata: MetadataCache,
    refresh_flights: KeyedLocks<(String, String)>,
}

impl OAuthClient {
    pub fn new(config: &ProxyConfig) -> Result<Self, AuthProxyError> {
        let http = build_http_client(config.ca_file.as_deref())?;
        Ok(Self {
            client_id: config.effective_client_id(),
            redirect_uri: config.redirect_uri(),
            http,
            tokens: TokenStore::new(),
            states: StateStore::new(),
            metadata: MetadataCache::new(),
            refresh_flights: KeyedLocks::new(),
        })
    }

    /// The HTTP client, for components that must share its TLS trust.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn states(&self) -> &StateStore {
        &self.states
    }

    /// Discover (or serve from cache) the issuer's metadata.
    pub async fn discover_metadata(
        &self,
        issuer: &str,
    ) -> Result<AuthServerMetadata, AuthProxyError> {
        self.metadata.discover(&self.http, issuer).await
    }

    /// Resolve the issuer behind an RFC 9728 `resource_metadata` URL, for
    /// challenges that advertise one instead of a realm.
    pub async fn resolve_resource_issuer(
        &self,
        resource_metadata_url: &str,
    ) -> Result<String, AuthProxyError> {
        metadata::resolve_resource_issuer(&self.http, resource_metadata_url).await
    }

    /// Build the authorization URL for one flow: discover the issuer,
    /// generate PKCE material, persist the flow state, and compose the
    /// query.
    ///
    /// The returned URL carries the S256 challenge and the encoded state;
    /// the verifier stays in the state store.
    pub async fn build_authorize_url(
        &self,
        session_id: &str,
        server_name: &str,
        issuer: &str,
        scope: &str,
    ) -> Result<String, AuthProxyError> {
        let metadata = self.discover_metadata(issuer).await?;
        let pkce = PkcePair::generate();

        let (encoded_state, _nonce) = self
            .states
            .generate_state(session_id, server_name, issuer, pkce.verifier)
            .await;

        let mut url = Url::parse(&metadata.authorization_endpoint).map_err(|err| {
            AuthProxyError::InvalidInput(format!(
                "issuer {issuer} advertises an invalid authorization endpoint: {err}"
            ))
        })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &self.client_id);
            query.append_pair("redirect_uri", &self.redirect_uri);
            query.append_pair("state", &encoded_state);
            query.append_pair("code_challenge", &pkce.challenge);
            query.append_pair("code_challenge_method", "S256");
            if !scope.is_empty() {
                query.append_pair("scope", scope);
            }
        }

        Ok(url.into())
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &Secret,
        issuer: &str,
    ) -> Result<Token, AuthProxyError> {
        let metadata = self.discover_metadata(issuer).await?;

        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", &self.redirect_uri),
                ("client_id", &self.client_id),
                ("code_verifier", code_verifier.value()),
            ])
            .send()
            .await?;

        parse_token_response(response, issuer, "authorization code exchange").await
    }

    /// Refresh `token` against its issuer.
    ///
    /// The issuer carries over, and when the response omits a refresh
    /// token or scope the previous values are preserved.
    pub async fn refresh_token(&self, token: &Token) -> Result<Token, AuthProxyError> {
        let refresh_token = token.refresh_token.as_ref().ok_or_else(|| {
            AuthProxyError::InvalidInput("token has no refresh token".to_string())
        })?;
        let metadata = self.discover_metadata(&token.issuer).await?;

        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.value()),
                ("client_id", &self.client_id),
            ])
            .send()
            .await?;

        let mut refreshed = parse_token_response(response, &token.issuer, "token refresh").await?;
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = token.refresh_token.clone();
        }
        if refreshed.scope.is_empty() {
            refreshed.scope = token.scope.clone();
        }
        Ok(refreshed)
    }

    /// Proactively refresh the session's token for `issuer` when it is
    /// inside the refresh window.
    ///
    /// Returns the usable token and whether a refresh actually happened.
    /// Concurrent calls for the same `(session, issuer)` collapse into one
    /// refresh request: late callers re-check the store under the key lock
    /// and find the fresh token already installed. The whole operation is
    /// bounded by a 30-second deadline.
    pub async fn refresh_token_if_needed(
        &self,
        session_id: &str,
        issuer: &str,
    ) -> Result<(Token, bool), AuthProxyError> {
        let _flight = self
            .refresh_flights
            .acquire((session_id.to_string(), issuer.to_string()))
            .await;

        let (key, token) = self
            .tokens
            .get_by_issuer_including_expiring(session_id, issuer)
            .await
            .ok_or(AuthProxyError::TokenNotFound)?;

        if !token.needs_refresh() {
            return Ok((token, false));
        }
        if token.refresh_token.is_none() {
            // Nothing we can do; the caller gets the aging token and the
            // next 401 will start a fresh flow.
            return Ok((token, false));
        }

        let refreshed = tokio::time::timeout(REFRESH_DEADLINE, self.refresh_token(&token))
            .await
            .map_err(|_| AuthProxyError::Timeout)??;

        self.tokens.store(key, refreshed.clone()).await;
        tracing::debug!(issuer, "proactively refreshed token");
        Ok((refreshed, true))
    }

    /// Start the stores' background eviction tasks.
    pub fn start_background_tasks(&self) {
        self.tokens.start_sweeper();
        self.states.start_sweeper();
    }

    /// Stop the background tasks. Idempotent; lookups keep working.
    pub fn stop(&self) {
        self.tokens.stop();
        self.states.stop();
    }
}

/// Build the outbound HTTP client.
///
/// With a CA file configured the client trusts exactly that root: the
/// built-in store is disabled so a private IdP deployment cannot silently
/// fall back to public trust.
pub(crate) fn build_http_client(ca_file: Option<&Path>) -> Result<reqwest::Client, AuthProxyError> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));

    if let Some(path) = ca_file {
        let pem = fs::read(path).map_err(|err| {
            AuthProxyError::Config(format!("cannot read ca_file {}: {err}", path.display()))
        })?;
        let certificate = reqwest::Certificate::from_pem(&pem).map_err(|err| {
            AuthProxyError::Config(format!("ca_file {} is not valid PEM: {err}", path.display()))
        })?;
        builder = builder
            .tls_built_in_root_certs(false)
            .add_root_certificate(certificate);
    }

    builder.build().map_err(AuthProxyError::Http)
}

async fn parse_token_response(
    response: reqwest::Response,
    issuer: &str,
    context: &'static str,
) -> Result<Token, AuthProxyError> {
    let status = response.status();
    if !status.is_success() {
        // Bodies can carry sensitive IdP detail; they stay at debug level
        // and never reach the returned error.
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(%status, body = %body, context, "token endpoint returned an error");
        return Err(AuthProxyError::TokenEndpoint { status });
    }

    let parsed: TokenResponse = response.json().await?;
    Ok(parsed.into_token(issuer))
}
