//! Pluggable idempotency key generation strategies (§4.2).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{QueueError, Result};

/// Capability set `{Generate(payload) → key, Validate(key) → ok/err}`. Implementations must be
/// deterministic for the same logical event when used by the outbox (§4.4 step 1), which rules
/// out [`UuidKeyGenerator`] for that caller — it is intended for producer-supplied dedup keys
/// where a fresh key per logical submission is exactly the point.
pub trait IdempotencyKeyGenerator: Send + Sync {
    fn generate(&self, payload: &[u8]) -> String;
    fn validate(&self, key: &str) -> Result<()>;
}

/// Random v4 UUID per call — independent of payload content, so calling it twice for the same
/// logical request yields two different keys. Suited to producers that already carry their own
/// request identity and only need an opaque reservation token.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidKeyGenerator;

impl IdempotencyKeyGenerator for UuidKeyGenerator {
    fn generate(&self, _payload: &[u8]) -> String {
        Uuid::new_v4().to_string()
    }

    fn validate(&self, key: &str) -> Result<()> {
        Uuid::parse_str(key)
            .map(|_| ())
            .map_err(|e| QueueError::InvalidInput(format!("not a valid uuid key: {e}")))
    }
}

/// SHA-256 of the payload, base64url-encoded and truncated to `len` characters. Deterministic:
/// the same payload bytes always produce the same key, which is what makes it usable as the
/// outbox's "idempotency key deterministically from event id" generator.
#[derive(Debug, Clone)]
pub struct ContentHashKeyGenerator {
    len: usize,
}

impl ContentHashKeyGenerator {
    pub fn new(len: usize) -> Self {
        Self { len: len.clamp(8, 43) }
    }
}

impl Default for ContentHashKeyGenerator {
    fn default() -> Self {
        Self::new(22)
    }
}

impl IdempotencyKeyGenerator for ContentHashKeyGenerator {
    fn generate(&self, payload: &[u8]) -> String {
        let digest = Sha256::digest(payload);
        let encoded = URL_SAFE_NO_PAD.encode(digest);
        encoded.chars().take(self.len).collect()
    }

    fn validate(&self, key: &str) -> Result<()> {
        if key.len() < 8 || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(QueueError::InvalidInput(format!(
                "not a valid content-hash key: {key}"
            )));
        }
        Ok(())
    }
}

/// Content hash prefix plus a random suffix — collapses true duplicates (same hash) into the
/// same bucket for analysis while still guaranteeing uniqueness for callers that pass
/// near-duplicate payloads they don't want collapsed at the storage layer itself.
#[derive(Debug, Clone)]
pub struct HybridKeyGenerator {
    hash_len: usize,
}

impl HybridKeyGenerator {
    pub fn new(hash_len: usize) -> Self {
        Self { hash_len: hash_len.clamp(6, 32) }
    }
}

impl Default for HybridKeyGenerator {
    fn default() -> Self {
        Self::new(12)
    }
}

impl IdempotencyKeyGenerator for HybridKeyGenerator {
    fn generate(&self, payload: &[u8]) -> String {
        let digest = Sha256::digest(payload);
        let encoded = URL_SAFE_NO_PAD.encode(digest);
        let prefix: String = encoded.chars().take(self.hash_len).collect();
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{prefix}.{}", &suffix[..8])
    }

    fn validate(&self, key: &str) -> Result<()> {
        let (prefix, suffix) = key
            .split_once('.')
            .ok_or_else(|| QueueError::InvalidInput(format!("not a valid hybrid key: {key}")))?;
        if prefix.is_empty() || suffix.len() != 8 {
            return Err(QueueError::InvalidInput(format!("not a valid hybrid key: {key}")));
        }
        Ok(())
    }
}
