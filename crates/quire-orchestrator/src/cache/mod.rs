//! Response caching.
//!
//! Successful generations are cached by a hash of the request's bounded
//! prompt prefix, section, model and temperature, so repeating a request
//! within the TTL never reaches the upstream.

mod store;
mod types;

pub use store::ResponseCache;
pub use types::{CacheEntry, CacheKey, CacheStats};

use crate::context::GenerationResult;
use std::time::Duration;

/// Storage for cached generation results.
///
/// Implementations must be safe to share across tasks and must never return
/// an entry past its TTL.
pub trait ResponseStore: Send + Sync {
    /// Looks up a fresh entry.
    fn get(&self, key: &CacheKey) -> Option<GenerationResult>;

    /// Stores `value` for `ttl`, replacing any previous entry.
    fn set(&self, key: CacheKey, value: GenerationResult, ttl: Duration);

    /// Removes every expired entry, returning how many were removed.
    fn sweep(&self) -> usize;

    fn stats(&self) -> CacheStats;
}
