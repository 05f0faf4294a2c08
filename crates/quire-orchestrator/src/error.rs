//! Error types for request orchestration.

use crate::config::ConfigError;
use crate::context::StoreError;
use quire_abstraction::UpstreamError;
use std::time::Duration;
use thiserror::Error;

/// Everything that can go wrong while serving a generation request.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The conversation used up its request quota for the current window.
    #[error("Rate limit exceeded for conversation '{conversation_id}', retry after {retry_after:?}")]
    RateLimitExceeded {
        /// Conversation that was throttled.
        conversation_id: String,
        /// Time until a request may succeed again.
        retry_after: Duration,
    },

    /// The input matched a disallowed-content rule.
    #[error("Content rejected by rule '{rule}'")]
    ContentRejected {
        /// Name of the rule that matched.
        rule: String,
    },

    /// The prompt cannot be made to fit the section's token budget.
    #[error("Prompt needs {required} tokens but the budget is {budget}")]
    BudgetUnsatisfiable {
        /// Estimated tokens after maximal truncation.
        required: u32,
        /// Configured budget.
        budget: u32,
    },

    /// The upstream rejected the request in a way retrying cannot fix.
    #[error("Upstream rejected the request: {0}")]
    UpstreamNonRetriable(#[source] UpstreamError),

    /// Transient upstream failures outlasted the retry budget.
    #[error("Upstream failed after {attempts} attempts: {source}")]
    UpstreamRetriable {
        /// Attempts made, including the first.
        attempts: u32,
        /// The last error seen.
        #[source]
        source: UpstreamError,
    },

    /// The upstream stream broke after output had started.
    #[error("Stream interrupted after {received} chunks: {source}")]
    StreamInterrupted {
        /// Chunks delivered before the failure.
        received: u64,
        /// The error that ended the stream.
        #[source]
        source: UpstreamError,
    },

    /// The caller cancelled the generation.
    #[error("Generation cancelled")]
    Cancelled,

    /// Prior context could not be loaded from the conversation store.
    #[error("Prior context unavailable: {0}")]
    ContextUnavailable(#[from] StoreError),

    /// The orchestrator was configured incorrectly.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl OrchestratorError {
    /// Stable machine-readable code, used in error events sent to observers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::ContentRejected { .. } => "content_rejected",
            Self::BudgetUnsatisfiable { .. } => "budget_unsatisfiable",
            Self::UpstreamNonRetriable(_) => "upstream_non_retriable",
            Self::UpstreamRetriable { .. } => "upstream_retriable",
            Self::StreamInterrupted { .. } => "stream_interrupted",
            Self::Cancelled => "cancelled",
            Self::ContextUnavailable(_) => "context_unavailable",
            Self::Config(_) => "config",
        }
    }
}

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
