//! Token storage keyed by `(session, issuer, scope)`.
//!
//! The issuer-keyed lookups realize single sign-on across remote servers:
//! two servers sharing an identity provider hit the same stored token even
//! when their scopes differ.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use tokio::{sync::RwLock, task::JoinHandle};

use crate::{EXPIRY_MARGIN, secret::Secret};

/// How often the background sweep evicts expired tokens.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A bearer token as obtained from an identity provider.
#[derive(Debug, Clone, Default)]
pub struct Token {
    pub access_token: Secret,
    /// Always `Bearer` in practice; carried verbatim from the response.
    pub token_type: String,
    pub refresh_token: Option<Secret>,
    pub id_token: Option<Secret>,
    /// Space-separated scopes granted by the IdP (may be narrower or wider
    /// than requested).
    pub scope: String,
    /// Issuer the token was obtained from. Non-empty for every stored token.
    pub issuer: String,
    /// Lifetime in seconds as reported by the IdP. Zero when unknown.
    pub expires_in: u64,
    /// Absolute expiry on the monotonic clock. `None` means the token does
    /// not expire as far as we know.
    pub expires_at: Option<Instant>,
}

impl Token {
    /// Whether the token is past (or within `margin` of) its expiry.
    /// Tokens without an expiry never report expired.
    pub fn is_expired(&self, margin: Duration) -> bool {
        self.expires_at
            .is_some_and(|at| at <= Instant::now() + margin)
    }

    /// Whether the proactive-refresh path should renew this token: it has
    /// an expiry and that expiry falls within the refresh margin.
    pub fn needs_refresh(&self) -> bool {
        self.is_expired(EXPIRY_MARGIN)
    }
}

/// Key identifying one stored token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub session_id: String,
    pub issuer: String,
    pub scope: String,
}

impl TokenKey {
    pub fn new(
        session_id: impl Into<String>,
        issuer: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            issuer: issuer.into(),
            scope: scope.into(),
        }
    }
}

/// In-memory token store with issuer-level SSO lookups and periodic
/// eviction of expired entries.
///
/// All lookups apply the crate-wide [`EXPIRY_MARGIN`] so a token about to
/// expire is never handed out as valid.
pub struct TokenStore {
    entries: Arc<RwLock<HashMap<TokenKey, Token>>>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            sweeper: StdMutex::new(None),
        }
    }

    /// Install a token under `key`, replacing any previous entry.
    ///
    /// Fills in the absolute expiry from `expires_in` when the IdP did not
    /// provide one, and the issuer from the key, so stored entries always
    /// satisfy the store invariants regardless of the response shape.
    pub async fn store(&self, key: TokenKey, mut token: Token) {
        if token.expires_at.is_none() && token.expires_in > 0 {
            token.expires_at = Some(Instant::now() + Duration::from_secs(token.expires_in));
        }
        if token.issuer.is_empty() {
            token.issuer = key.issuer.clone();
        }
        let mut entries = self.entries.write().await;
        entries.insert(key, token);
    }

    /// Exact lookup. Returns nothing for absent or expiring entries.
    pub async fn get(&self, key: &TokenKey) -> Option<Token> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|token| !token.is_expired(EXPIRY_MARGIN))
            .cloned()
    }

    /// SSO lookup: any non-expiring token under `session_id` whose issuer
    /// matches, regardless of scope.
    pub async fn get_by_issuer(&self, session_id: &str, issuer: &str) -> Option<Token> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .find(|(key, token)| {
                key.session_id == session_id
                    && key.issuer == issuer
                    && !token.is_expired(EXPIRY_MARGIN)
            })
            .map(|(_, token)| token.clone())
    }

    /// Like [`get_by_issuer`](Self::get_by_issuer) but also returns entries
    /// inside the refresh window (only absolutely expired entries are
    /// skipped), together with their key. Used by the proactive-refresh
    /// path, which needs the key to re-store the renewed token.
    pub async fn get_by_issuer_including_expiring(
        &self,
        session_id: &str,
        issuer: &str,
    ) -> Option<(TokenKey, Token)> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .find(|(key, token)| {
                key.session_id == session_id
                    && key.issuer == issuer
                    && !token.is_expired(Duration::ZERO)
            })
            .map(|(key, token)| (key.clone(), token.clone()))
    }

    pub async fn delete(&self, key: &TokenKey) {
        let mut entries = self.entries.write().await;
        entries.remove(key);
    }

    /// Remove every token belonging to `session_id` (session teardown).
    pub async fn delete_by_session(&self, session_id: &str) {
        let mut entries = self.entries.write().await;
        entries.retain(|key, _| key.session_id != session_id);
    }

    /// Remove every token for `session_id` obtained from `issuer`.
    pub async fn delete_by_issuer(&self, session_id: &str, issuer: &str) {
        let mut entries = self.entries.write().await;
        entries.retain(|key, _| !(key.session_id == session_id && key.issuer == issuer));
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// One eviction pass: drop entries whose expiry lies in the past
    /// (margin zero; a token inside the refresh window is still usable by
    /// the refresh path and must survive the sweep).
    pub(crate) async fn sweep(&self) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, token| !token.is_expired(Duration::ZERO));
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = entries.len(), "evicted expired tokens");
        }
    }

    /// Start the periodic eviction task. Stopped (and therefore
    /// cancellable) via [`stop`](Self::stop); starting twice replaces the
    /// previous task.
    pub fn start_sweeper(&self) {
        let entries = Arc::clone(&self.entries);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut entries = entries.write().await;
                entries.retain(|_, token| !token.is_expired(Duration::ZERO));
            }
        });
        if let Some(previous) = self.sweeper.lock().expect("sweeper lock").replace(handle) {
            previous.abort();
        }
    }

    /// Cancel the background sweep. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().expect("sweeper lock").take() {
            handle.abort();
        }
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TokenStore {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(issuer: &str, scope: &str, expires_in: u64) -> Token {
        Token {
            access_token: Secret::new(format!("at-{issuer}-{scope}")),
            token_type: "Bearer".to_string(),
            refresh_token: None,
            id_token: None,
            scope: scope.to_string(),
            issuer: issuer.to_string(),
            expires_in,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn store_computes_absolute_expiry() {
        let store = TokenStore::new();
        let key = TokenKey::new("s1", "https://idp.test", "openid");
        store.store(key.clone(), token("https://idp.test", "openid", 3600)).await;

        let stored = store.get(&key).await.unwrap();
        let expires_at = stored.expires_at.expect("expiry computed at store time");
        let remaining = expires_at - Instant::now();
        assert!(remaining > Duration::from_secs(3590) && remaining <= Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn store_fills_in_issuer_from_key() {
        let store = TokenStore::new();
        let key = TokenKey::new("s1", "https://idp.test", "");
        let mut anonymous = token("", "", 3600);
        anonymous.issuer.clear();
        store.store(key.clone(), anonymous).await;

        assert_eq!(store.get(&key).await.unwrap().issuer, "https://idp.test");
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let store = TokenStore::new();
        store
            .store(
                TokenKey::new("session-a", "https://idp.test", "openid"),
                token("https://idp.test", "openid", 3600),
            )
            .await;

        let other = TokenKey::new("session-b", "https://idp.test", "openid");
        assert!(store.get(&other).await.is_none());
        assert!(store.get_by_issuer("session-b", "https://idp.test").await.is_none());
        assert!(
            store
                .get_by_issuer_including_expiring("session-b", "https://idp.test")
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn issuer_lookup_ignores_scope() {
        let store = TokenStore::new();
        store
            .store(
                TokenKey::new("s1", "https://idp.test", "openid profile"),
                token("https://idp.test", "openid profile", 3600),
            )
            .await;

        // SSO: a different remote server asking for a disjoint scope still
        // reuses the session's token for this issuer.
        let found = store.get_by_issuer("s1", "https://idp.test").await.unwrap();
        assert_eq!(found.scope, "openid profile");
        assert!(store.get_by_issuer("s1", "https://other.test").await.is_none());
    }

    #[tokio::test]
    async fn expiry_margin_is_thirty_seconds() {
        let store = TokenStore::new();
        let key = TokenKey::new("s1", "https://idp.test", "openid");
        let mut near_expiry = token("https://idp.test", "openid", 0);
        near_expiry.expires_at = Some(Instant::now() + Duration::from_secs(10));
        store.store(key.clone(), near_expiry).await;

        // 10s remaining: expired under the 30s margin, alive under margin 0.
        assert!(store.get(&key).await.is_none());
        assert!(store.get_by_issuer("s1", "https://idp.test").await.is_none());
        let (found_key, found) = store
            .get_by_issuer_including_expiring("s1", "https://idp.test")
            .await
            .unwrap();
        assert_eq!(found_key, key);
        assert!(found.needs_refresh());
    }

    #[tokio::test]
    async fn absolutely_expired_tokens_are_invisible() {
        let store = TokenStore::new();
        let key = TokenKey::new("s1", "https://idp.test", "openid");
        let mut expired = token("https://idp.test", "openid", 0);
        expired.expires_at = Some(Instant::now() - Duration::from_secs(1));
        store.store(key.clone(), expired).await;

        assert!(store.get(&key).await.is_none());
        assert!(
            store
                .get_by_issuer_including_expiring("s1", "https://idp.test")
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn tokens_without_expiry_never_expire() {
        let store = TokenStore::new();
        let key = TokenKey::new("s1", "https://idp.test", "openid");
        store.store(key.clone(), token("https://idp.test", "openid", 0)).await;

        let stored = store.get(&key).await.unwrap();
        assert_eq!(stored.expires_at, None);
        assert!(!stored.needs_refresh());
    }

    #[tokio::test]
    async fn delete_by_session_removes_all_entries() {
        let store = TokenStore::new();
        store
            .store(
                TokenKey::new("s1", "https://a.test", "openid"),
                token("https://a.test", "openid", 3600),
            )
            .await;
        store
            .store(
                TokenKey::new("s1", "https://b.test", "email"),
                token("https://b.test", "email", 3600),
            )
            .await;
        store
            .store(
                TokenKey::new("s2", "https://a.test", "openid"),
                token("https://a.test", "openid", 3600),
            )
            .await;

        store.delete_by_session("s1").await;
        assert_eq!(store.count().await, 1);
        assert!(store.get_by_issuer("s2", "https://a.test").await.is_some());
    }

    #[tokio::test]
    async fn delete_by_issuer_is_scoped_to_the_session() {
        let store = TokenStore::new();
        store
            .store(
                TokenKey::new("s1", "https://a.test", "openid"),
                token("https://a.test", "openid", 3600),
            )
            .await;
        store
            .store(
                TokenKey::new("s2", "https://a.test", "openid"),
                token("https://a.test", "openid", 3600),
            )
            .await;

        store.delete_by_issuer("s1", "https://a.test").await;
        assert!(store.get_by_issuer("s1", "https://a.test").await.is_none());
        assert!(store.get_by_issuer("s2", "https://a.test").await.is_some());
    }

    #[tokio::test]
    async fn sweep_removes_only_absolutely_expired_entries() {
        let store = TokenStore::new();
        let mut dead = token("https://idp.test", "a", 0);
        dead.expires_at = Some(Instant::now() - Duration::from_secs(1));
        let mut expiring = token("https://idp.test", "b", 0);
        expiring.expires_at = Some(Instant::now() + Duration::from_secs(10));

        store.store(TokenKey::new("s1", "https://idp.test", "a"), dead).await;
        store.store(TokenKey::new("s1", "https://idp.test", "b"), expiring).await;
        store
            .store(
                TokenKey::new("s1", "https://idp.test", "c"),
                token("https://idp.test", "c", 3600),
            )
            .await;

        store.sweep().await;
        assert_eq!(store.count().await, 2);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let store = TokenStore::new();
        store.start_sweeper();
        store.stop();
        store.stop();
    }
}
