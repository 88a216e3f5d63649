//! Per-attempt PKCE (RFC 7636, S256) and CSRF material.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore as _;
use sha2::{Digest, Sha256};

use crate::secret::Secret;

/// Everything one interactive login needs to bind the callback and the code
/// exchange to this process. Dropped as soon as the attempt ends.
///
/// The loopback port is recorded here once the callback listener is bound;
/// the listener itself stays owned by the caller.
pub struct AuthAttempt {
    code_verifier: Secret,
    code_challenge: String,
    state: Secret,
    redirect_port: Option<u16>,
}

impl AuthAttempt {
    /// 32 random bytes each for the verifier and the state, base64url without
    /// padding (43 characters).
    pub fn generate() -> Self {
        let code_verifier = random_token();
        let code_challenge = challenge_for(&code_verifier);
        Self {
            code_verifier: Secret::new(code_verifier),
            code_challenge,
            state: Secret::new(random_token()),
            redirect_port: None,
        }
    }

    pub fn with_redirect_port(mut self, port: u16) -> Self {
        self.redirect_port = Some(port);
        self
    }

    /// Loopback port the callback is expected on, once bound.
    pub fn redirect_port(&self) -> Option<u16> {
        self.redirect_port
    }

    pub fn code_verifier(&self) -> &Secret {
        &self.code_verifier
    }

    pub fn code_challenge(&self) -> &str {
        &self.code_challenge
    }

    pub fn state(&self) -> &Secret {
        &self.state
    }

    /// Constant-time comparison of a callback `state` with ours.
    pub fn state_matches(&self, received: &str) -> bool {
        constant_time_eq(self.state.expose().as_bytes(), received.as_bytes())
    }
}

impl fmt::Debug for AuthAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthAttempt")
            .field("code_verifier", &self.code_verifier)
            .field("code_challenge", &self.code_challenge)
            .field("state", &self.state)
            .field("redirect_port", &self.redirect_port)
            .finish()
    }
}

/// `BASE64URL(SHA256(ASCII(verifier)))`.
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Server-side check that a verifier produced a previously seen challenge.
pub fn verify_challenge(verifier: &str, challenge: &str) -> bool {
    constant_time_eq(challenge_for(verifier).as_bytes(), challenge.as_bytes())
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
