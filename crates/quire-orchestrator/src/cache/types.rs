//! Types for the response cache.

use crate::context::GenerationResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Hex-encoded SHA-256 identifying a cacheable request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives the key for a request.
    ///
    /// Only the first `prefix_chars` characters of the prompt take part.
    /// Fields are length-prefixed so that no two distinct field tuples hash
    /// the same input, and the temperature is rendered at a fixed precision.
    #[must_use]
    pub fn derive(prompt: &str, section_id: &str, model: &str, temperature: f32, prefix_chars: usize) -> Self {
        let prefix = prompt.char_indices().nth(prefix_chars).map_or(prompt, |(end, _)| &prompt[..end]);
        let temperature = format!("{temperature:.3}");

        let mut hasher = Sha256::new();
        for field in [prefix, section_id, model, temperature.as_str()] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// The hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored response. Entries are replaced, never mutated.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: GenerationResult,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    /// Creates an entry stamped with the current instant.
    #[must_use]
    pub fn new(value: GenerationResult, ttl: Duration) -> Self {
        Self { value, created_at: Instant::now(), ttl }
    }

    /// Whether the entry is past its TTL at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// Cache counters since creation (or the last `clear`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_hex_sha256() {
        let key = CacheKey::derive("prompt", "intro", "model", 0.7, 500);
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_key_depends_on_every_field() {
        let base = CacheKey::derive("prompt", "intro", "model", 0.7, 500);
        assert_eq!(base, CacheKey::derive("prompt", "intro", "model", 0.7, 500));
        assert_ne!(base, CacheKey::derive("prompt!", "intro", "model", 0.7, 500));
        assert_ne!(base, CacheKey::derive("prompt", "market", "model", 0.7, 500));
        assert_ne!(base, CacheKey::derive("prompt", "intro", "other", 0.7, 500));
        assert_ne!(base, CacheKey::derive("prompt", "intro", "model", 0.2, 500));
    }

    #[test]
    fn test_fields_do_not_run_together() {
        let a = CacheKey::derive("ab", "c", "m", 0.0, 500);
        let b = CacheKey::derive("a", "bc", "m", 0.0, 500);
        assert_ne!(a, b);
    }

    #[test]
    fn test_only_prefix_participates() {
        let a = CacheKey::derive("same start, different tail one", "s", "m", 0.5, 10);
        let b = CacheKey::derive("same start, different tail two", "s", "m", 0.5, 10);
        assert_eq!(a, b);
    }

    #[test]
    fn test_temperature_precision() {
        let a = CacheKey::derive("p", "s", "m", 0.700_01, 500);
        let b = CacheKey::derive("p", "s", "m", 0.7, 500);
        assert_eq!(a, b);
    }
}
