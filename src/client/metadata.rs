//! Authorization-server metadata discovery with caching and fetch
//! deduplication.
//!
//! Discovery tries RFC 8414 (`/.well-known/oauth-authorization-server`)
//! first and falls back to OIDC discovery
//! (`/.well-known/openid-configuration`). Results are cached per issuer for
//! 30 minutes; concurrent cold-cache callers for the same issuer collapse
//! into a single fetch.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::flight::KeyedLocks;
use crate::error::AuthProxyError;

/// How long a fetched metadata document stays valid.
const METADATA_TTL: Duration = Duration::from_secs(30 * 60);

/// OAuth 2.0 authorization-server metadata (RFC 8414), with the OIDC
/// discovery document deserializing into the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    #[serde(default)]
    pub grant_types_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// RFC 9728 protected-resource metadata, fetched when a challenge
/// advertises `resource_metadata` instead of a realm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub authorization_servers: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub bearer_methods_supported: Vec<String>,
}

struct CachedMetadata {
    metadata: AuthServerMetadata,
    fetched_at: Instant,
}

impl CachedMetadata {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < METADATA_TTL
    }
}

/// Issuer-keyed metadata cache.
pub struct MetadataCache {
    entries: RwLock<HashMap<String, CachedMetadata>>,
    flights: KeyedLocks<String>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            flights: KeyedLocks::new(),
        }
    }

    /// Return the issuer's metadata, fetching it if the cache is cold or
    /// stale.
    ///
    /// At most one fetch per issuer is in flight at any time: late callers
    /// queue on the issuer's lock and find the winner's result in the
    /// cache. Distinct issuers do not contend.
    pub async fn discover(
        &self,
        http: &reqwest::Client,
        issuer: &str,
    ) -> Result<AuthServerMetadata, AuthProxyError> {
        let issuer = issuer.trim_end_matches('/');

        if let Some(metadata) = self.lookup(issuer).await {
            return Ok(metadata);
        }

        let _flight = self.flights.acquire(issuer.to_string()).await;
        // A queued caller lands here after the winner populated the cache.
        if let Some(metadata) = self.lookup(issuer).await {
            return Ok(metadata);
        }

        let metadata = fetch_metadata(http, issuer).await?;
        let mut entries = self.entries.write().await;
        entries.insert(
            issuer.to_string(),
            CachedMetadata {
                metadata: metadata.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(metadata)
    }

    async fn lookup(&self, issuer: &str) -> Option<AuthServerMetadata> {
        let entries = self.entries.read().await;
        entries
            .get(issuer)
            .filter(|cached| cached.is_fresh())
            .map(|cached| cached.metadata.clone())
    }

    #[cfg(test)]
    pub(crate) async fn expire(&self, issuer: &str) {
        let issuer = issuer.trim_end_matches('/');
        let mut entries = self.entries.write().await;
        // Early in a machine's uptime the monotonic clock cannot be wound
        // back a full TTL; dropping the entry has the same observable
        // effect (the next discover refetches).
        match Instant::now().checked_sub(METADATA_TTL) {
            Some(past) => {
                if let Some(cached) = entries.get_mut(issuer) {
                    cached.fetched_at = past;
                }
            }
            None => {
                entries.remove(issuer);
            }
        }
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the issuer behind an RFC 9728 `resource_metadata` URL: fetch
/// the document and take its first advertised authorization server.
pub async fn resolve_resource_issuer(
    http: &reqwest::Client,
    resource_metadata_url: &str,
) -> Result<String, AuthProxyError> {
    tracing::debug!(url = %resource_metadata_url, "fetching protected resource metadata");
    let response = http.get(resource_metadata_url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(AuthProxyError::MetadataUnavailable {
            issuer: resource_metadata_url.to_string(),
            oauth_status: format!("resource metadata -> {status}"),
            oidc_status: "not attempted".to_string(),
        });
    }

    let metadata: ProtectedResourceMetadata = response.json().await?;
    metadata
        .authorization_servers
        .into_iter()
        .find(|issuer| !issuer.is_empty())
        .ok_or_else(|| {
            AuthProxyError::InvalidInput(format!(
                "resource metadata at {resource_metadata_url} lists no authorization servers"
            ))
        })
}

/// One fetch attempt against both well-known locations.
async fn fetch_metadata(
    http: &reqwest::Client,
    issuer: &str,
) -> Result<AuthServerMetadata, AuthProxyError> {
    let oauth_url = format!("{issuer}/.well-known/oauth-authorization-server");
    tracing::debug!(url = %oauth_url, "fetching authorization server metadata");
    let oauth_status = match try_fetch(http, &oauth_url).await {
        Ok(metadata) => return Ok(metadata),
        Err(status) => status,
    };

    let oidc_url = format!("{issuer}/.well-known/openid-configuration");
    tracing::debug!(url = %oidc_url, "falling back to openid configuration");
    let oidc_status = match try_fetch(http, &oidc_url).await {
        Ok(metadata) => return Ok(metadata),
        Err(status) => status,
    };

    Err(AuthProxyError::MetadataUnavailable {
        issuer: issuer.to_string(),
        oauth_status,
        oidc_status,
    })
}

/// Fetch one well-known URL. The error is a short status description for
/// the aggregate discovery error; bodies are never captured.
async fn try_fetch(http: &reqwest::Client, url: &str) -> Result<AuthServerMetadata, String> {
    let response = match http.get(url).send().await {
        Ok(response) => response,
        Err(err) => return Err(format!("request failed: {err}")),
    };
    let status = response.status();
    if !status.is_success() {
        return Err(status.to_string());
    }
    response
        .json::<AuthServerMetadata>()
        .await
        .map_err(|err| format!("invalid metadata document: {err}"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    fn metadata_body(issuer: &str) -> serde_json::Value {
        serde_json::json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/authorize"),
            "token_endpoint": format!("{issuer}/token"),
            "jwks_uri": format!("{issuer}/keys"),
            "grant_types_supported": ["authorization_code", "refresh_token"],
            "code_challenge_methods_supported": ["S256"],
        })
    }

    #[tokio::test]
    async fn fetches_oauth_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(metadata_body(&server.uri())))
            .expect(1)
            .mount(&server)
            .await;

        let cache = MetadataCache::new();
        let metadata = cache
            .discover(&reqwest::Client::new(), &server.uri())
            .await
            .unwrap();

        assert_eq!(metadata.issuer, server.uri());
        assert_eq!(metadata.token_endpoint, format!("{}/token", server.uri()));
    }

    #[tokio::test]
    async fn falls_back_to_openid_configuration() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(metadata_body(&server.uri())))
            .expect(1)
            .mount(&server)
            .await;

        let cache = MetadataCache::new();
        let metadata = cache
            .discover(&reqwest::Client::new(), &server.uri())
            .await
            .unwrap();
        assert_eq!(metadata.issuer, server.uri());
    }

    #[tokio::test]
    async fn both_endpoints_failing_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let cache = MetadataCache::new();
        let err = cache
            .discover(&reqwest::Client::new(), &server.uri())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthProxyError::MetadataUnavailable { .. }));
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn cache_hit_avoids_the_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(metadata_body(&server.uri())))
            .expect(1)
            .mount(&server)
            .await;

        let cache = MetadataCache::new();
        let http = reqwest::Client::new();
        cache.discover(&http, &server.uri()).await.unwrap();
        cache.discover(&http, &server.uri()).await.unwrap();
        // Trailing slash normalizes to the same cache entry.
        cache
            .discover(&http, &format!("{}/", server.uri()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_entries_are_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(metadata_body(&server.uri())))
            .expect(2)
            .mount(&server)
            .await;

        let cache = MetadataCache::new();
        let http = reqwest::Client::new();
        cache.discover(&http, &server.uri()).await.unwrap();
        cache.expire(&server.uri()).await;
        cache.discover(&http, &server.uri()).await.unwrap();
    }

    #[tokio::test]
    async fn resource_metadata_resolves_to_its_first_authorization_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-protected-resource"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "resource": "https://rs.example.com",
                "authorization_servers": ["https://auth.example.com", "https://backup.example.com"],
            })))
            .mount(&server)
            .await;

        let issuer = resolve_resource_issuer(
            &reqwest::Client::new(),
            &format!("{}/.well-known/oauth-protected-resource", server.uri()),
        )
        .await
        .unwrap();
        assert_eq!(issuer, "https://auth.example.com");
    }

    #[tokio::test]
    async fn resource_metadata_without_servers_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "resource": "https://rs.example.com",
            })))
            .mount(&server)
            .await;

        let err = resolve_resource_issuer(&reqwest::Client::new(), &server.uri())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthProxyError::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_discovery_coalesces_to_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(metadata_body(&server.uri()))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cache = Arc::new(MetadataCache::new());
        let http = reqwest::Client::new();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let http = http.clone();
            let issuer = server.uri();
            tasks.push(tokio::spawn(async move {
                cache.discover(&http, &issuer).await
            }));
        }

        for task in tasks {
            let metadata = task.await.unwrap().unwrap();
            assert_eq!(metadata.issuer, server.uri());
        }
    }
}
