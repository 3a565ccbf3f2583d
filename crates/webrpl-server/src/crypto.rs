use std::num::NonZeroU32;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::util::random_bytes;

const OUTPUT_LEN: usize = 32;
const SALT_LEN: usize = 16;
const SCHEME: &str = "pbkdf2-sha256";

/// Roughly 100ms per hash on a current x86 core.
pub const DEFAULT_ITERATIONS: u32 = 600_000;

/// Upper bound accepted when parsing a stored hash.
const MAX_ITERATIONS: u32 = 10_000_000;

fn derive(secret: &[u8], salt: &[u8], iterations: u32) -> [u8; OUTPUT_LEN] {
    let mut out = [0u8; OUTPUT_LEN];
    pbkdf2_hmac::<Sha256>(secret, salt, iterations, &mut out);
    out
}

/// Hash a password with a fresh random salt.
///
/// Output format: `pbkdf2-sha256$<iterations>$<salt b64>$<hash b64>`.
pub fn hash_password(secret: &[u8], iterations: NonZeroU32) -> Result<String> {
    let salt = random_bytes(SALT_LEN)
        .map_err(|e| Error::Hashing(format!("entropy source unavailable: {e}")))?;
    let out = derive(secret, &salt, iterations.get());

    Ok(format!(
        "{SCHEME}${}${}${}",
        iterations,
        STANDARD_NO_PAD.encode(&salt),
        STANDARD_NO_PAD.encode(out)
    ))
}

struct StoredHash {
    iterations: u32,
    salt: Vec<u8>,
    hash: Vec<u8>,
}

fn parse_stored(stored: &str) -> Option<StoredHash> {
    let mut parts = stored.split('$');
    if parts.next()? != SCHEME {
        return None;
    }
    let iterations: u32 = parts.next()?.parse().ok()?;
    if iterations == 0 || iterations > MAX_ITERATIONS {
        return None;
    }
    let salt = STANDARD_NO_PAD.decode(parts.next()?).ok()?;
    let hash = STANDARD_NO_PAD.decode(parts.next()?).ok()?;
    if parts.next().is_some() || salt.is_empty() || hash.len() != OUTPUT_LEN {
        return None;
    }

    Some(StoredHash {
        iterations,
        salt,
        hash,
    })
}

/// Check `candidate` against a stored hash.
///
/// A malformed stored value is a mismatch, not an error.
pub fn verify_password(stored: &str, candidate: &[u8]) -> bool {
    let Some(parsed) = parse_stored(stored) else {
        return false;
    };

    // Derive and constant-time compare.
    let out = derive(candidate, &parsed.salt, parsed.iterations);
    subtle::ConstantTimeEq::ct_eq(out.as_ref(), parsed.hash.as_slice()).into()
}

/// Runs password hashing on the blocking pool, at most `workers` at a time.
#[derive(Clone)]
pub struct Hasher {
    permits: Arc<Semaphore>,
    iterations: NonZeroU32,
}

impl Hasher {
    pub fn new(workers: usize, iterations: NonZeroU32) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            iterations,
        }
    }

    pub async fn hash(&self, secret: String) -> Result<String> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Hashing(e.to_string()))?;
        let iterations = self.iterations;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            hash_password(secret.as_bytes(), iterations)
        })
        .await
        .map_err(|e| Error::Hashing(format!("hashing task failed: {e}")))?
    }

    pub async fn verify(&self, stored: String, candidate: String) -> Result<bool> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Hashing(e.to_string()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            verify_password(&stored, candidate.as_bytes())
        })
        .await
        .map_err(|e| Error::Hashing(format!("verification task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iterations() -> NonZeroU32 {
        NonZeroU32::new(1_000).unwrap()
    }

    #[test]
    fn hash_then_verify() {
        let stored = hash_password(b"hunter2", iterations()).unwrap();
        assert!(stored.starts_with("pbkdf2-sha256$1000$"));
        assert!(!stored.contains("hunter2"));
        assert!(verify_password(&stored, b"hunter2"));
        assert!(!verify_password(&stored, b"hunter3"));
        assert!(!verify_password(&stored, b""));
    }

    #[test]
    fn salts_differ_between_calls() {
        let a = hash_password(b"same", iterations()).unwrap();
        let b = hash_password(b"same", iterations()).unwrap();
        assert_ne!(a, b);
        assert!(verify_password(&a, b"same"));
        assert!(verify_password(&b, b"same"));
    }

    #[test]
    fn malformed_hashes_never_verify() {
        for stored in [
            "",
            "plaintext",
            "pbkdf2-sha256$0$AAAA$AAAA",
            "pbkdf2-sha256$abc$AAAA$AAAA",
            "bcrypt$1000$AAAA$AAAA",
            "pbkdf2-sha256$1000$!!!$AAAA",
            "pbkdf2-sha256$1000$AAAA$AAAA",
        ] {
            assert!(!verify_password(stored, b"anything"), "{stored}");
        }
    }

    #[tokio::test]
    async fn pooled_hasher_round_trip() {
        let hasher = Hasher::new(2, iterations());
        let stored = hasher.hash("s3cret".to_string()).await.unwrap();
        assert!(hasher.verify(stored.clone(), "s3cret".to_string()).await.unwrap());
        assert!(!hasher.verify(stored, "S3cret".to_string()).await.unwrap());
    }
}
