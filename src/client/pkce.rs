//! PKCE (Proof Key for Code Exchange), always S256.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::secret::Secret;

/// A verifier/challenge pair for one authorization flow.
///
/// The verifier is secret-typed: it is stored server-side with the flow
/// state and sent only in the final token request, never in the
/// authorization URL.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: Secret,
    pub challenge: String,
}

impl PkcePair {
    /// Generate a fresh pair: 32 random bytes as the URL-safe verifier,
    /// SHA-256 of the verifier text as the challenge.
    pub fn generate() -> Self {
        let mut verifier_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut verifier_bytes);
        let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        Self {
            verifier: Secret::new(verifier),
            challenge,
        }
    }
}
