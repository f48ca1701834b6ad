//! Per-flow authorization state, keyed by a cryptographic nonce.
//!
//! The `state=` query parameter carries a base64url-encoded JSON claims
//! document; the PKCE code verifier stays server-side in the store record
//! and is structurally absent from the wire form. Validation is single-use:
//! the entry is removed in the same critical section that reads it, so a
//! replayed `state` can never succeed twice.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, task::JoinHandle};

use crate::secret::Secret;

/// How long a pending authorization may take before the state expires.
const STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// How often the background sweep evicts stale states.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Server-side record of one in-flight authorization.
#[derive(Debug, Clone)]
pub struct AuthState {
    pub session_id: String,
    pub server_name: String,
    pub issuer: String,
    /// 256-bit random value carried in the `state=` parameter.
    pub nonce: String,
    pub created_at: DateTime<Utc>,
    /// PKCE code verifier. Lives only in this record, never on the wire.
    pub code_verifier: Secret,
}

impl AuthState {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > chrono::Duration::from_std(STATE_TTL).expect("ttl fits")
    }
}

/// The wire form of the `state=` parameter.
///
/// A dedicated claims struct rather than a serialization of [`AuthState`]:
/// the verifier cannot leak into the encoded state because this type has no
/// field for it.
#[derive(Debug, Serialize, Deserialize)]
struct StateClaims {
    session_id: String,
    server_name: String,
    nonce: String,
    created_at: DateTime<Utc>,
    issuer: String,
}

/// Store of pending authorization states with TTL eviction and single-use
/// consumption.
pub struct StateStore {
    entries: Arc<RwLock<HashMap<String, AuthState>>>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            sweeper: StdMutex::new(None),
        }
    }

    /// Create and store a new authorization state.
    ///
    /// Returns the encoded `state=` parameter value and the nonce it is
    /// keyed under.
    pub async fn generate_state(
        &self,
        session_id: &str,
        server_name: &str,
        issuer: &str,
        code_verifier: Secret,
    ) -> (String, String) {
        let mut nonce_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = URL_SAFE_NO_PAD.encode(nonce_bytes);

        let state = AuthState {
            session_id: session_id.to_string(),
            server_name: server_name.to_string(),
            issuer: issuer.to_string(),
            nonce: nonce.clone(),
            created_at: Utc::now(),
            code_verifier,
        };

        let claims = StateClaims {
            session_id: state.session_id.clone(),
            server_name: state.server_name.clone(),
            nonce: nonce.clone(),
            created_at: state.created_at,
            issuer: state.issuer.clone(),
        };
        let payload = serde_json::to_vec(&claims).expect("state claims serialize");
        let encoded = URL_SAFE_NO_PAD.encode(payload);

        let mut entries = self.entries.write().await;
        entries.insert(nonce.clone(), state);

        (encoded, nonce)
    }

    /// Decode a returning `state=` value, consume the matching record, and
    /// return it.
    ///
    /// Returns `None` for anything that does not check out: undecodable
    /// input, an unknown or already-consumed nonce, or an expired record.
    /// Removal happens in the same write-lock critical section as the
    /// lookup, so of two concurrent validations of the same value exactly
    /// one wins.
    pub async fn validate_state(&self, encoded: &str) -> Option<AuthState> {
        let payload = URL_SAFE_NO_PAD.decode(encoded.as_bytes()).ok()?;
        let claims: StateClaims = serde_json::from_slice(&payload).ok()?;

        let state = {
            let mut entries = self.entries.write().await;
            entries.remove(&claims.nonce)?
        };

        // TTL is judged on the stored record, not the decodable claims.
        if state.is_expired(Utc::now()) {
            tracing::debug!(server_name = %state.server_name, "authorization state expired");
            return None;
        }

        Some(state)
    }

    pub async fn delete(&self, nonce: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(nonce);
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// One eviction pass over stale entries.
    pub(crate) async fn sweep(&self) {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, state| !state.is_expired(now));
    }

    /// Start the periodic eviction task; cancelled via [`stop`](Self::stop).
    pub fn start_sweeper(&self) {
        let entries = Arc::clone(&self.entries);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let mut entries = entries.write().await;
                entries.retain(|_, state| !state.is_expired(now));
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

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        self.stop();
    }
}
