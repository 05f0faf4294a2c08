//! Upstream client abstraction for Quire.
//!
//! This crate defines the contract between the request orchestrator and any
//! completion provider: role-tagged messages in, a completion (or a stream of
//! deltas) out, and a closed error type that is classified once, here, at the
//! boundary.

use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// How the orchestrator must react to an [`UpstreamError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Fail immediately and propagate the error unchanged.
    NonRetriable,
    /// Retry with backoff; propagate once attempts are exhausted.
    Retriable,
    /// Retry with backoff; substitute a canned response once attempts are exhausted.
    FallbackEligible,
}

impl ErrorClass {
    /// Whether the retry policy may attempt the call again.
    pub fn is_retriable(self) -> bool {
        !matches!(self, Self::NonRetriable)
    }
}

/// An error returned by an upstream completion provider.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpstreamError {
    /// The request was malformed or rejected as invalid (4xx).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or invalid credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Credentials valid but access to the resource is denied.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The provider refused the content.
    #[error("Content policy violation: {0}")]
    ContentPolicy(String),

    /// The provider answered, but the body could not be understood.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The attempt did not finish within its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The provider failed on its side (5xx).
    #[error("Server error ({status}): {message}")]
    Server {
        /// HTTP-equivalent status code.
        status: u16,
        /// Error body or description.
        message: String,
    },

    /// The provider could not be reached at all.
    #[error("Network error: {0}")]
    Network(String),

    /// The provider is throttling us.
    #[error("Upstream rate limited: {message}")]
    RateLimited {
        /// Optional hint for how long to wait before the next attempt.
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after: Option<Duration>,
        /// Error body or description.
        message: String,
    },
}

impl UpstreamError {
    /// Classifies the error for retry and fallback decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidRequest(_)
            | Self::Unauthorized(_)
            | Self::Forbidden(_)
            | Self::ContentPolicy(_)
            | Self::MalformedResponse(_) => ErrorClass::NonRetriable,
            Self::Timeout(_) | Self::Server { .. } => ErrorClass::Retriable,
            Self::Network(_) | Self::RateLimited { .. } => ErrorClass::FallbackEligible,
        }
    }

    /// Shorthand for `self.class().is_retriable()`.
    pub fn is_retriable(&self) -> bool {
        self.class().is_retriable()
    }

    /// Whether exhausting retries on this error should degrade to a fallback.
    pub fn is_fallback_eligible(&self) -> bool {
        self.class() == ErrorClass::FallbackEligible
    }

    /// Wait hint supplied by the provider, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Maps an HTTP status code returned by a provider to an error variant.
    ///
    /// Adapters call this exactly once per failed response so that call sites
    /// never need to inspect status codes themselves.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        match status {
            401 => Self::Unauthorized(message),
            403 => Self::Forbidden(message),
            408 => Self::Timeout(message),
            402 | 429 => Self::RateLimited { retry_after, message },
            500..=599 => Self::Server { status, message },
            _ => Self::InvalidRequest(format!("status {status}: {message}")),
        }
    }
}

/// The author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions that frame the whole exchange.
    System,
    /// Input from the person driving the dialogue.
    User,
    /// Output previously produced by the model.
    Assistant,
}

impl Role {
    /// Wire name of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single role-tagged message sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Who wrote the message.
    pub role: Role,
    /// The message text.
    pub content: String,
}

impl Message {
    /// Creates a message with an explicit role.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Parameters for controlling generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionParams {
    /// Provider model identifier.
    pub model: String,

    /// Sampling temperature, between 0 and 2.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum number of tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sequences that stop generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

impl CompletionParams {
    /// Parameters for `model` with provider defaults for everything else.
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into(), temperature: None, max_tokens: None, stop_sequences: None }
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the response.
    Stop,
    /// The token limit was reached.
    Length,
    /// The provider filtered the output.
    ContentFilter,
    /// A canned response was substituted for a real one.
    Fallback,
    /// The provider did not say.
    Unknown,
}

impl FinishReason {
    /// Parses the provider's finish reason string.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" | "end_turn" | "stop_sequence" => Self::Stop,
            "length" | "max_tokens" => Self::Length,
            "content_filter" => Self::ContentFilter,
            _ => Self::Unknown,
        }
    }
}

/// Token usage for a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    pub prompt_tokens: u32,
    /// Tokens in the completion.
    pub completion_tokens: u32,
    /// Total tokens.
    pub total_tokens: u32,
}

impl Usage {
    /// Usage with the total derived from its parts.
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// A finished, non-streaming completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Generated text.
    pub text: String,
    /// Usage reported by the provider, if any.
    pub usage: Option<Usage>,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
    /// Model that actually served the request, if reported.
    pub model: Option<String>,
}

/// One incremental unit of a streaming completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDelta {
    /// Newly generated text (may be empty on the final unit).
    pub delta: String,
    /// Whether this is the last unit of the stream.
    pub done: bool,
    /// Finish reason, normally present only on the last unit.
    pub finish_reason: Option<FinishReason>,
    /// Usage, if the provider reports it at the end of the stream.
    pub usage: Option<Usage>,
}

impl StreamDelta {
    /// A non-terminal text delta.
    pub fn text(delta: impl Into<String>) -> Self {
        Self { delta: delta.into(), done: false, finish_reason: None, usage: None }
    }

    /// The terminal unit of a stream.
    pub fn finish(finish_reason: FinishReason, usage: Option<Usage>) -> Self {
        Self { delta: String::new(), done: true, finish_reason: Some(finish_reason), usage }
    }
}

/// Stream of deltas produced by [`UpstreamClient::complete_stream`].
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, UpstreamError>> + Send>>;

/// A completion provider.
///
/// Implementations must be `Send + Sync` so one client can serve many
/// conversations concurrently.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Produces a full completion for `messages`.
    ///
    /// # Errors
    /// Returns a classified [`UpstreamError`] if the provider call fails.
    async fn complete(
        &self,
        messages: &[Message],
        params: &CompletionParams,
    ) -> Result<Completion, UpstreamError>;

    /// Opens a streaming completion for `messages`.
    ///
    /// Errors returned here happen before any delta was produced; errors
    /// yielded by the stream happen mid-stream.
    ///
    /// # Errors
    /// Returns a classified [`UpstreamError`] if the stream cannot be opened.
    async fn complete_stream(
        &self,
        messages: &[Message],
        params: &CompletionParams,
    ) -> Result<CompletionStream, UpstreamError>;

    /// Short provider name used in logs.
    fn name(&self) -> &str;
}
