//! Top-level facade tying the OAuth client, the token exchanger, and the
//! HTTP endpoints together.
//!
//! The embedding server owns exactly one [`OAuthProxy`] per configuration.
//! A proxy built from a disabled configuration is a null object: every
//! method is a safe no-op returning zero values or
//! [`AuthProxyError::Disabled`], so call sites need no enabled-checks.

use std::{collections::HashMap, sync::Arc};

use axum::{Router, routing::get};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::{
    challenge::BearerChallenge,
    client::OAuthClient,
    config::ProxyConfig,
    error::AuthProxyError,
    exchange::{ExchangeCacheStats, ExchangedToken, TokenExchangeConfig, TokenExchanger},
    http,
    secret::Secret,
    store::token::{Token, TokenKey},
};

/// Hook invoked after a callback completes: `(session_id, server_name,
/// access_token)`. Failures are logged and never fail the flow — the token
/// is already stored by the time the hook runs.
pub type AuthCompletionCallback = Arc<
    dyn Fn(
            String,
            String,
            Secret,
        ) -> BoxFuture<'static, Result<(), Box<dyn std::error::Error + Send + Sync>>>
        + Send
        + Sync,
>;

/// A remote server's registered identity requirements.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServerBinding {
    pub server_name: String,
    pub issuer: String,
    pub scope: String,
}

/// What the aggregator returns to the end user instead of a failed remote
/// call: an instruction to visit the authorization URL.
#[derive(Debug, Clone, Serialize)]
pub struct AuthChallenge {
    /// Always `auth_required`.
    pub status: &'static str,
    pub auth_url: String,
    pub server_name: String,
    pub message: String,
}

pub(crate) struct ProxyInner {
    pub(crate) config: ProxyConfig,
    pub(crate) client: OAuthClient,
    pub(crate) exchanger: TokenExchanger,
    pub(crate) bindings: RwLock<HashMap<String, ServerBinding>>,
    pub(crate) completion: RwLock<Option<AuthCompletionCallback>>,
}

/// The proxy facade. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct OAuthProxy {
    inner: Option<Arc<ProxyInner>>,
}

impl OAuthProxy {
    /// Build a proxy from `config`.
    ///
    /// A disabled configuration yields the null sentinel; an enabled one
    /// validates the config, builds the (optionally CA-pinned) HTTP client
    /// shared between the OAuth client and the token exchanger, and starts
    /// the store sweepers. Must run inside a Tokio runtime (the sweepers
    /// are spawned here).
    pub fn new(mut config: ProxyConfig) -> Result<Self, AuthProxyError> {
        config.validate()?;
        if !config.enabled {
            tracing::info!("oauth proxy disabled");
            return Ok(Self::disabled());
        }

        let client = OAuthClient::new(&config)?;
        client.start_background_tasks();
        let exchanger = TokenExchanger::new(client.http().clone());

        tracing::info!(
            public_url = %config.public_url,
            callback_path = %config.callback_path,
            self_hosted_cimd = config.should_serve_cimd(),
            "oauth proxy initialized"
        );

        Ok(Self {
            inner: Some(Arc::new(ProxyInner {
                config,
                client,
                exchanger,
                bindings: RwLock::new(HashMap::new()),
                completion: RwLock::new(None),
            })),
        })
    }

    /// The null sentinel: semantically identical to a proxy constructed
    /// with `enabled: false`.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Bind `server_name` to the issuer and scope it authenticates with.
    pub async fn register_server(&self, server_name: &str, issuer: &str, scope: &str) {
        let Some(inner) = &self.inner else { return };
        let mut bindings = inner.bindings.write().await;
        bindings.insert(
            server_name.to_string(),
            ServerBinding {
                server_name: server_name.to_string(),
                issuer: issuer.trim_end_matches('/').to_string(),
                scope: scope.to_string(),
            },
        );
    }

    pub async fn server_config(&self, server_name: &str) -> Option<ServerBinding> {
        let inner = self.inner.as_ref()?;
        let bindings = inner.bindings.read().await;
        bindings.get(server_name).cloned()
    }

    /// The session's token for a registered remote server, proactively
    /// refreshed when it is inside the refresh window.
    pub async fn get_token(&self, session_id: &str, server_name: &str) -> Option<Token> {
        let binding = self.server_config(server_name).await?;
        self.get_token_by_issuer(session_id, &binding.issuer).await
    }

    /// The session's token for an issuer (SSO path: any scope qualifies),
    /// proactively refreshed when needed.
    ///
    /// When a due refresh fails the stored, not-yet-absolutely-expired
    /// token is returned instead: it may still be accepted upstream, and
    /// a rejection there starts a fresh flow anyway.
    pub async fn get_token_by_issuer(&self, session_id: &str, issuer: &str) -> Option<Token> {
        let inner = self.inner.as_ref()?;
        match inner.client.refresh_token_if_needed(session_id, issuer).await {
            Ok((token, _refreshed)) => Some(token),
            Err(AuthProxyError::TokenNotFound) => None,
            Err(err) => {
                tracing::warn!(error = %err, issuer, "token refresh failed, using stored token");
                inner
                    .client
                    .tokens()
                    .get_by_issuer_including_expiring(session_id, issuer)
                    .await
                    .map(|(_, token)| token)
            }
        }
    }

    /// Drop the session's tokens for `issuer` (e.g. after the upstream
    /// rejected one as invalid).
    pub async fn clear_token_by_issuer(&self, session_id: &str, issuer: &str) {
        let Some(inner) = &self.inner else { return };
        inner.client.tokens().delete_by_issuer(session_id, issuer).await;
    }

    /// Start an authorization flow for `server_name`: bind the server,
    /// build the authorization URL, and return the challenge the
    /// aggregator forwards to the user.
    pub async fn create_auth_challenge(
        &self,
        session_id: &str,
        server_name: &str,
        issuer: &str,
        scope: &str,
    ) -> Result<AuthChallenge, AuthProxyError> {
        let Some(inner) = &self.inner else {
            return Err(AuthProxyError::Disabled);
        };

        // A 401 from an unregistered server creates its binding.
        self.register_server(server_name, issuer, scope).await;

        let auth_url = inner
            .client
            .build_authorize_url(session_id, server_name, issuer, scope)
            .await?;

        Ok(AuthChallenge {
            status: "auth_required",
            auth_url,
            server_name: server_name.to_string(),
            message: format!(
                "Authentication required for {server_name}. Visit the authentication URL to sign in."
            ),
        })
    }

    /// Turn a remote server's `401` challenge into an auth challenge for
    /// the user.
    ///
    /// The issuer is the challenge's realm; a challenge that only carries
    /// `resource_metadata` is resolved through the advertised document's
    /// authorization server list. Non-OAuth challenges (`Basic`, a Bearer
    /// without any issuer anchor) are rejected so the aggregator can fall
    /// through to its other error handling.
    pub async fn handle_unauthorized(
        &self,
        session_id: &str,
        server_name: &str,
        www_authenticate: &str,
    ) -> Result<AuthChallenge, AuthProxyError> {
        let Some(inner) = &self.inner else {
            return Err(AuthProxyError::Disabled);
        };

        let challenge = BearerChallenge::parse(www_authenticate);
        if !challenge.is_oauth_challenge() {
            return Err(AuthProxyError::InvalidInput(
                "www-authenticate header is not an oauth bearer challenge".to_string(),
            ));
        }

        let issuer = match challenge.issuer() {
            Some(realm) => realm.to_string(),
            None => {
                // is_oauth_challenge guarantees resource_metadata here.
                let url = challenge.resource_metadata.as_deref().unwrap_or_default();
                inner.client.resolve_resource_issuer(url).await?
            }
        };
        let scope = challenge.scope.clone().unwrap_or_default();

        self.create_auth_challenge(session_id, server_name, &issuer, &scope)
            .await
    }

    /// Programmatic callback handling, equivalent to the HTTP endpoint
    /// minus the HTML. Used by embedders that terminate the redirect
    /// themselves.
    pub async fn handle_callback(&self, code: &str, state: &str) -> Result<(), AuthProxyError> {
        let Some(inner) = &self.inner else {
            return Err(AuthProxyError::Disabled);
        };

        let auth_state = inner
            .client
            .states()
            .validate_state(state)
            .await
            .ok_or(AuthProxyError::StateInvalid("is unknown, expired, or already used"))?;
        if auth_state.issuer.is_empty() || auth_state.code_verifier.is_empty() {
            return Err(AuthProxyError::StateInvalid("record is incomplete"));
        }

        let token = inner
            .client
            .exchange_code(code, &auth_state.code_verifier, &auth_state.issuer)
            .await?;

        let key = TokenKey::new(
            auth_state.session_id.clone(),
            auth_state.issuer.clone(),
            token.scope.clone(),
        );
        inner.client.tokens().store(key, token.clone()).await;

        let completion = inner.completion.read().await.clone();
        if let Some(hook) = completion {
            if let Err(err) = hook(
                auth_state.session_id,
                auth_state.server_name.clone(),
                token.access_token,
            )
            .await
            {
                tracing::warn!(
                    error = %err,
                    server_name = %auth_state.server_name,
                    "auth completion callback failed"
                );
            }
        }
        Ok(())
    }

    /// Router serving the callback endpoint and, when the client id is
    /// auto-derived, the Client ID Metadata Document. Empty for a disabled
    /// proxy.
    pub fn router(&self) -> Router {
        let Some(inner) = &self.inner else {
            return Router::new();
        };

        let mut router = Router::new().route(
            &inner.config.callback_path,
            get(http::callback::callback),
        );
        if inner.config.should_serve_cimd() {
            router = router.route(&inner.config.cimd_path, get(http::cimd::client_metadata));
        }
        router.with_state(Arc::clone(inner))
    }

    pub fn callback_path(&self) -> String {
        self.inner
            .as_ref()
            .map(|inner| inner.config.callback_path.clone())
            .unwrap_or_default()
    }

    pub fn cimd_path(&self) -> String {
        self.inner
            .as_ref()
            .map(|inner| inner.config.cimd_path.clone())
            .unwrap_or_default()
    }

    pub fn should_serve_cimd(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.config.should_serve_cimd())
    }

    /// Install the post-authentication hook (replacing any previous one).
    pub async fn set_auth_completion_callback(&self, callback: AuthCompletionCallback) {
        let Some(inner) = &self.inner else { return };
        let mut slot = inner.completion.write().await;
        *slot = Some(callback);
    }

    /// RFC 8693: exchange a locally-valid token for one accepted by a
    /// remote cluster. Returns the exchanged access token.
    pub async fn exchange_token_for_remote_cluster(
        &self,
        subject_token: &Secret,
        user_id: &str,
        config: &TokenExchangeConfig,
    ) -> Result<Secret, AuthProxyError> {
        let Some(inner) = &self.inner else {
            return Err(AuthProxyError::Disabled);
        };
        inner
            .exchanger
            .exchange(subject_token, user_id, config)
            .await
            .map(|exchanged: ExchangedToken| exchanged.access_token)
    }

    /// Variant with a caller-supplied HTTP client (mTLS through a proxy).
    /// The exchange cache is shared with the default path.
    pub async fn exchange_token_for_remote_cluster_with_client(
        &self,
        subject_token: &Secret,
        user_id: &str,
        config: &TokenExchangeConfig,
        http_client: &reqwest::Client,
    ) -> Result<Secret, AuthProxyError> {
        let Some(inner) = &self.inner else {
            return Err(AuthProxyError::Disabled);
        };
        inner
            .exchanger
            .exchange_with_client(http_client, subject_token, user_id, config)
            .await
            .map(|exchanged| exchanged.access_token)
    }

    /// Drop expired exchange-cache entries.
    pub fn cleanup_exchange_cache(&self) {
        if let Some(inner) = &self.inner {
            inner.exchanger.cleanup();
        }
    }

    /// Forget one cached exchange result (e.g. after the remote cluster
    /// rejected the exchanged token).
    pub fn clear_exchange_cache(&self, endpoint: &str, connector_id: &str, user_id: &str) {
        if let Some(inner) = &self.inner {
            inner.exchanger.clear_cache(endpoint, connector_id, user_id);
        }
    }

    pub fn clear_exchange_caches(&self) {
        if let Some(inner) = &self.inner {
            inner.exchanger.clear_all();
        }
    }

    /// Exchange-cache counters; zero-valued for a disabled proxy.
    pub fn exchange_cache_stats(&self) -> ExchangeCacheStats {
        self.inner
            .as_ref()
            .map(|inner| inner.exchanger.cache_stats())
            .unwrap_or(ExchangeCacheStats {
                entries: 0,
                max_entries: 0,
            })
    }

    /// Stop background sweeping. Idempotent; lookups and flows keep
    /// answering from memory afterwards.
    pub fn stop(&self) {
        if let Some(inner) = &self.inner {
            inner.client.stop();
            tracing::debug!("oauth proxy stopped");
        }
    }
}
