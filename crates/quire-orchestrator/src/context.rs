//! Request and result types, and the conversation store seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use quire_abstraction::{FinishReason, Usage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default sampling temperature when the caller does not pick one.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Everything that identifies one generation request, apart from the input text.
///
/// Immutable once built; construct a new one per invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    conversation_id: String,
    section_id: String,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    streaming: bool,
    prior_context: serde_json::Value,
}

impl RequestContext {
    /// Starts building a context.
    pub fn builder(
        conversation_id: impl Into<String>,
        section_id: impl Into<String>,
        model: impl Into<String>,
    ) -> RequestContextBuilder {
        RequestContextBuilder {
            context: Self {
                conversation_id: conversation_id.into(),
                section_id: section_id.into(),
                model: model.into(),
                temperature: DEFAULT_TEMPERATURE,
                max_tokens: None,
                streaming: false,
                prior_context: serde_json::Value::Null,
            },
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn section_id(&self) -> &str {
        &self.section_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Completion token limit forwarded to the upstream.
    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    pub fn streaming(&self) -> bool {
        self.streaming
    }

    /// Caller-supplied context from earlier sections.
    pub fn prior_context(&self) -> &serde_json::Value {
        &self.prior_context
    }
}

/// Builder for [`RequestContext`].
#[derive(Debug, Clone)]
pub struct RequestContextBuilder {
    context: RequestContext,
}

impl RequestContextBuilder {
    #[must_use]
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.context.temperature = temperature;
        self
    }

    #[must_use]
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.context.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.context.streaming = streaming;
        self
    }

    #[must_use]
    pub fn prior_context(mut self, prior_context: serde_json::Value) -> Self {
        self.context.prior_context = prior_context;
        self
    }

    #[must_use]
    pub fn build(self) -> RequestContext {
        self.context
    }
}

/// Outcome of a generation, cached and returned verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub timestamp: DateTime<Utc>,
    /// True when the text is canned fallback rather than model output.
    pub fallback: bool,
    pub model: String,
}

/// Errors from a [`ConversationStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Conversation store unavailable: {0}")]
    Unavailable(String),
}

/// Read-only source of prior-section summaries.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Summary of what the conversation produced so far, if any.
    async fn prior_context(&self, conversation_id: &str) -> Result<Option<String>, StoreError>;
}

/// A store that never has prior context.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPriorContext;

#[async_trait]
impl ConversationStore for NoPriorContext {
    async fn prior_context(&self, _conversation_id: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }
}

/// In-memory summaries keyed by conversation.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    summaries: DashMap<String, String>,
}

impl InMemoryConversationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the conversation's summary.
    pub fn set_summary(&self, conversation_id: impl Into<String>, summary: impl Into<String>) {
        self.summaries.insert(conversation_id.into(), summary.into());
    }

    pub fn clear(&self, conversation_id: &str) {
        self.summaries.remove(conversation_id);
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn prior_context(&self, conversation_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.summaries.get(conversation_id).map(|s| s.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let ctx = RequestContext::builder("c1", "intro", "gpt-4o-mini").build();
        assert_eq!(ctx.conversation_id(), "c1");
        assert_eq!(ctx.section_id(), "intro");
        assert_eq!(ctx.model(), "gpt-4o-mini");
        assert!((ctx.temperature() - DEFAULT_TEMPERATURE).abs() < f32::EPSILON);
        assert_eq!(ctx.max_tokens(), None);
        assert!(!ctx.streaming());
        assert!(ctx.prior_context().is_null());
    }

    #[test]
    fn test_builder_overrides() {
        let ctx = RequestContext::builder("c1", "intro", "m")
            .temperature(0.1)
            .max_tokens(256)
            .streaming(true)
            .prior_context(serde_json::json!({"company": "Acme"}))
            .build();
        assert_eq!(ctx.max_tokens(), Some(256));
        assert!(ctx.streaming());
        assert_eq!(ctx.prior_context()["company"], "Acme");
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryConversationStore::new();
        assert_eq!(store.prior_context("c1").await.unwrap(), None);

        store.set_summary("c1", "Acme sells anvils.");
        assert_eq!(store.prior_context("c1").await.unwrap().as_deref(), Some("Acme sells anvils."));

        store.clear("c1");
        assert_eq!(store.prior_context("c1").await.unwrap(), None);
        assert_eq!(NoPriorContext.prior_context("c1").await.unwrap(), None);
    }
}
