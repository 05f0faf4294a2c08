//! Per-conversation token usage accounting.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use quire_abstraction::Usage;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Cumulative usage of one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUsage {
    pub conversation_id: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Completed calls, fallbacks included.
    pub request_count: u64,
    pub fallback_count: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl SessionUsage {
    fn new(conversation_id: &str) -> Self {
        Self { conversation_id: conversation_id.to_string(), ..Self::default() }
    }
}

/// Storage for usage counters.
pub trait UsageStore: Send + Sync {
    /// Adds one completed call to the conversation's totals.
    fn record(&self, conversation_id: &str, usage: &Usage, fallback: bool);

    fn get(&self, conversation_id: &str) -> Option<SessionUsage>;

    /// Clears the conversation's counters, returning what they were.
    fn reset(&self, conversation_id: &str) -> Option<SessionUsage>;
}

/// In-memory [`UsageStore`].
#[derive(Debug, Default)]
pub struct UsageTracker {
    sessions: DashMap<String, SessionUsage>,
}

impl UsageTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of conversations with recorded usage.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl UsageStore for UsageTracker {
    fn record(&self, conversation_id: &str, usage: &Usage, fallback: bool) {
        let mut session = self
            .sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| SessionUsage::new(conversation_id));

        session.prompt_tokens += u64::from(usage.prompt_tokens);
        session.completion_tokens += u64::from(usage.completion_tokens);
        session.total_tokens += u64::from(usage.total_tokens);
        session.request_count += 1;
        if fallback {
            session.fallback_count += 1;
        }
        session.last_updated = Some(Utc::now());

        debug!(
            conversation_id,
            total_tokens = session.total_tokens,
            request_count = session.request_count,
            "Usage recorded"
        );
    }

    fn get(&self, conversation_id: &str) -> Option<SessionUsage> {
        self.sessions.get(conversation_id).map(|s| s.clone())
    }

    fn reset(&self, conversation_id: &str) -> Option<SessionUsage> {
        self.sessions.remove(conversation_id).map(|(_, session)| session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates() {
        let tracker = UsageTracker::new();
        tracker.record("c1", &Usage::new(10, 5), false);
        tracker.record("c1", &Usage::new(3, 2), false);

        let usage = tracker.get("c1").unwrap();
        assert_eq!(usage.prompt_tokens, 13);
        assert_eq!(usage.completion_tokens, 7);
        assert_eq!(usage.total_tokens, 20);
        assert_eq!(usage.request_count, 2);
        assert_eq!(usage.fallback_count, 0);
        assert!(usage.last_updated.is_some());
    }

    #[test]
    fn test_fallback_counts_request_not_tokens() {
        let tracker = UsageTracker::new();
        tracker.record("c1", &Usage::default(), true);

        let usage = tracker.get("c1").unwrap();
        assert_eq!(usage.total_tokens, 0);
        assert_eq!(usage.request_count, 1);
        assert_eq!(usage.fallback_count, 1);
    }

    #[test]
    fn test_reset_returns_previous_and_clears() {
        let tracker = UsageTracker::new();
        tracker.record("c1", &Usage::new(1, 1), false);
        tracker.record("c2", &Usage::new(1, 1), false);

        assert_eq!(tracker.reset("c1").unwrap().total_tokens, 2);
        assert!(tracker.get("c1").is_none());
        assert!(tracker.reset("c1").is_none());
        assert_eq!(tracker.len(), 1);
    }
}
