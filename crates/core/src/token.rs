//! Per-job capability secrets.
//!
//! A secret is 32 random bytes from the OS RNG, disclosed to the submitter
//! exactly once as unpadded URL-safe base64 (43 characters). Only an Argon2id
//! PHC string over the raw bytes is stored, so the secret cannot be recovered
//! from the job record.
//!
//! Verification separates two failure modes:
//!
//! - [`Verification::Malformed`]: the presented text does not match the
//!   canonical grammar. Rejected before any digest work.
//! - [`Verification::Unauthorized`]: well-formed, but the constant-time
//!   Argon2 comparison against the stored digest failed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use argon2::password_hash::rand_core::{OsRng, RngCore};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::CoreError;

/// Number of random bytes in a capability secret (256 bits).
pub const SECRET_BYTES: usize = 32;

/// Length of the encoded secret: unpadded base64 of [`SECRET_BYTES`].
pub const SECRET_LEN: usize = 43;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl TokenParams {
    /// Digest output length in bytes.
    pub const OUTPUT_LEN: usize = 32;

    pub const fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            memory_kib,
            iterations,
            parallelism,
        }
    }
}

impl Default for TokenParams {
    /// 64 MiB, 3 passes, single lane.
    fn default() -> Self {
        Self::new(64 * 1024, 3, 1)
    }
}

/// The one-time secret handed back to the submitter. `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct CapabilitySecret(String);

impl CapabilitySecret {
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for CapabilitySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CapabilitySecret(<redacted>)")
    }
}

/// Result of [`TokenAuthority::issue`].
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub secret: CapabilitySecret,
    /// PHC-formatted Argon2id digest (algorithm, version, params, salt, hash).
    pub digest: String,
}

/// Outcome of checking a presented secret against a stored digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Authorized,
    Unauthorized,
    Malformed,
}

/// Issues and verifies capability secrets.
pub struct TokenAuthority {
    argon2: Argon2<'static>,
    comparisons: AtomicU64,
}

impl TokenAuthority {
    /// Authority with the production cost parameters.
    pub fn new() -> Self {
        Self::with_params(TokenParams::default()).expect("default Argon2 params are valid")
    }

    /// Authority with explicit cost parameters.
    pub fn with_params(params: TokenParams) -> Result<Self, CoreError> {
        let params = Params::new(
            params.memory_kib,
            params.iterations,
            params.parallelism,
            Some(TokenParams::OUTPUT_LEN),
        )
        .map_err(|e| CoreError::Validation(format!("Invalid Argon2 parameters: {e}")))?;

        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
            comparisons: AtomicU64::new(0),
        })
    }

    /// Generate a fresh secret and its digest.
    pub fn issue(&self) -> Result<IssuedToken, CoreError> {
        let mut raw = [0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut raw);

        let salt = SaltString::generate(&mut OsRng);
        let digest = self
            .argon2
            .hash_password(&raw, &salt)
            .map_err(|e| CoreError::Internal(format!("Failed to digest capability secret: {e}")))?
            .to_string();

        Ok(IssuedToken {
            secret: CapabilitySecret(URL_SAFE_NO_PAD.encode(raw)),
            digest,
        })
    }

    /// Check `presented` against `digest`.
    ///
    /// Malformed input returns immediately without touching the digest.
    pub fn verify(&self, presented: &str, digest: &str) -> Verification {
        let Some(raw) = decode_secret(presented) else {
            return Verification::Malformed;
        };

        self.comparisons.fetch_add(1, Ordering::Relaxed);

        let Ok(parsed) = PasswordHash::new(digest) else {
            return Verification::Unauthorized;
        };
        match self.argon2.verify_password(&raw, &parsed) {
            Ok(()) => Verification::Authorized,
            Err(_) => Verification::Unauthorized,
        }
    }

    /// Whether `presented` matches the canonical secret grammar.
    pub fn is_well_formed(presented: &str) -> bool {
        decode_secret(presented).is_some()
    }

    /// Number of digest comparisons performed so far.
    pub fn digest_comparisons(&self) -> u64 {
        self.comparisons.load(Ordering::Relaxed)
    }
}

impl Default for TokenAuthority {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a presented secret, enforcing exactly [`SECRET_LEN`] characters
/// from the URL-safe alphabet with no padding and canonical trailing bits.
fn decode_secret(presented: &str) -> Option<[u8; SECRET_BYTES]> {
    if presented.len() != SECRET_LEN {
        return None;
    }
    if !presented
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(presented).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> TokenAuthority {
        TokenAuthority::with_params(TokenParams::new(1024, 1, 1)).unwrap()
    }

    #[test]
    fn issued_secret_matches_grammar() {
        let issued = authority().issue().unwrap();
        let secret = issued.secret.expose();
        assert_eq!(secret.len(), SECRET_LEN);
        assert!(TokenAuthority::is_well_formed(secret));
        assert!(!secret.contains('='));
    }

    #[test]
    fn digest_is_self_describing_argon2id() {
        let issued = authority().issue().unwrap();
        assert!(issued.digest.starts_with("$argon2id$v=19$m=1024,t=1,p=1$"));
        assert!(!issued.digest.contains(issued.secret.expose()));
    }

    #[test]
    fn issued_pair_verifies() {
        let authority = authority();
        let issued = authority.issue().unwrap();
        assert_eq!(
            authority.verify(issued.secret.expose(), &issued.digest),
            Verification::Authorized
        );
    }

    #[test]
    fn secrets_are_not_interchangeable() {
        let authority = authority();
        let a = authority.issue().unwrap();
        let b = authority.issue().unwrap();
        assert_ne!(a.secret, b.secret);
        assert_eq!(
            authority.verify(a.secret.expose(), &b.digest),
            Verification::Unauthorized
        );
    }

    #[test]
    fn malformed_input_skips_digest_comparison() {
        let authority = authority();
        let issued = authority.issue().unwrap();

        let too_short = &issued.secret.expose()[..42];
        let padded = format!("{}=", &issued.secret.expose()[..42]);
        let bad_alphabet = format!("{}+", &issued.secret.expose()[..42]);
        for presented in ["", "abc", too_short, &padded, &bad_alphabet] {
            assert_eq!(
                authority.verify(presented, &issued.digest),
                Verification::Malformed,
                "{presented:?} should be malformed"
            );
        }
        assert_eq!(authority.digest_comparisons(), 0);

        authority.verify(issued.secret.expose(), &issued.digest);
        assert_eq!(authority.digest_comparisons(), 1);
    }

    #[test]
    fn non_canonical_trailing_bits_are_malformed() {
        // 43 chars encode 258 bits; the final character must leave the low
        // two bits clear. 'B' sets one of them.
        let presented = format!("{}B", "A".repeat(42));
        assert!(!TokenAuthority::is_well_formed(&presented));
        assert!(TokenAuthority::is_well_formed(&"A".repeat(43)));
    }

    #[test]
    fn corrupt_digest_is_unauthorized() {
        let authority = authority();
        let issued = authority.issue().unwrap();
        assert_eq!(
            authority.verify(issued.secret.expose(), "not-a-phc-string"),
            Verification::Unauthorized
        );
    }

    #[test]
    fn debug_output_redacts_secret() {
        let issued = authority().issue().unwrap();
        let rendered = format!("{:?}", issued.secret);
        assert!(!rendered.contains(issued.secret.expose()));
    }
}
