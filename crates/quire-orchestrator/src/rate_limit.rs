//! Per-conversation fixed-window rate limiting.

use crate::config::RateLimitConfig;
use crate::error::{OrchestratorError, Result};
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Request admission control keyed by conversation.
pub trait RateLimit: Send + Sync {
    /// Admits one request or fails with `RateLimitExceeded`.
    fn check(&self, conversation_id: &str) -> Result<()>;

    /// Forgets the conversation's window, including any active block.
    fn reset(&self, conversation_id: &str);

    /// Drops unblocked windows that started more than `max_idle` ago.
    /// Returns how many were dropped.
    fn evict_idle(&self, max_idle: Duration) -> usize;
}

/// Counter state for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWindow {
    pub conversation_id: String,
    pub count: u32,
    pub window_start: Instant,
    pub blocked_until: Option<Instant>,
}

impl RateWindow {
    fn new(conversation_id: &str, now: Instant) -> Self {
        Self { conversation_id: conversation_id.to_string(), count: 0, window_start: now, blocked_until: None }
    }

    fn restart(&mut self, now: Instant) {
        self.count = 0;
        self.window_start = now;
    }
}

/// Fixed-window limiter: at most `quota` requests per `window`.
///
/// When `block` is non-zero, a rejected request also blocks the conversation
/// for that long; the window cannot reset while the block lasts.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    windows: DashMap<String, RateWindow>,
    quota: u32,
    window: Duration,
    block: Duration,
}

impl FixedWindowLimiter {
    /// Creates a limiter without a post-violation block.
    #[must_use]
    pub fn new(quota: u32, window: Duration) -> Self {
        Self { windows: DashMap::new(), quota, window, block: Duration::ZERO }
    }

    /// Blocks a conversation for `block` after each violation.
    #[must_use]
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.quota, config.window()).with_block(config.block())
    }

    /// Snapshot of a conversation's window.
    pub fn window(&self, conversation_id: &str) -> Option<RateWindow> {
        self.windows.get(conversation_id).map(|w| w.clone())
    }

    /// Number of conversations with a live window.
    pub fn tracked_conversations(&self) -> usize {
        self.windows.len()
    }
}

impl RateLimit for FixedWindowLimiter {
    fn check(&self, conversation_id: &str) -> Result<()> {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(conversation_id.to_string())
            .or_insert_with(|| RateWindow::new(conversation_id, now));
        let window = entry.value_mut();

        if let Some(until) = window.blocked_until {
            if now < until {
                let retry_after = until - now;
                debug!(conversation_id, retry_after_ms = retry_after.as_millis() as u64, "Conversation is blocked");
                return Err(OrchestratorError::RateLimitExceeded {
                    conversation_id: conversation_id.to_string(),
                    retry_after,
                });
            }
            window.blocked_until = None;
            window.restart(now);
        }

        if now.saturating_duration_since(window.window_start) > self.window {
            window.restart(now);
        }

        if window.count >= self.quota {
            let retry_after = if self.block.is_zero() {
                (window.window_start + self.window).saturating_duration_since(now)
            } else {
                window.blocked_until = Some(now + self.block);
                self.block
            };
            warn!(
                conversation_id,
                quota = self.quota,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
            return Err(OrchestratorError::RateLimitExceeded {
                conversation_id: conversation_id.to_string(),
                retry_after,
            });
        }

        window.count += 1;
        Ok(())
    }

    fn reset(&self, conversation_id: &str) {
        if self.windows.remove(conversation_id).is_some() {
            debug!(conversation_id, "Rate window reset");
        }
    }

    fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        // A window that is still open holds live quota and is never evicted.
        let keep_for = max_idle.max(self.window);
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            let blocked = window.blocked_until.is_some_and(|until| until > now);
            blocked || now.saturating_duration_since(window.window_start) <= keep_for
        });
        let evicted = before.saturating_sub(self.windows.len());
        if evicted > 0 {
            debug!(evicted, "Evicted idle rate windows");
        }
        evicted
    }
}
