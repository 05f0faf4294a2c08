//! Request orchestration and streaming delivery for Quire.
//!
//! This crate turns a user's section input into a bounded, resilient call to
//! an [`UpstreamClient`](quire_abstraction::UpstreamClient):
//!
//! - **Admission**: per-conversation fixed-window rate limiting
//! - **Caching**: TTL response cache keyed by a hash of the request
//! - **Screening**: regex content filter applied before any network call
//! - **Budgeting**: token estimates and oldest-first prompt truncation
//! - **Resilience**: exponential backoff with jitter, per-attempt timeouts and
//!   canned fallbacks when the upstream is unavailable
//! - **Streaming**: chunk fan-out to every connection watching a conversation
//!
//! # Example
//!
//! ```rust,no_run
//! use quire_models::ScriptedClient;
//! use quire_orchestrator::{Orchestrator, OrchestratorConfig, RequestContext};
//! use std::sync::Arc;
//!
//! # async fn example() -> quire_orchestrator::Result<()> {
//! let orchestrator = Orchestrator::builder(OrchestratorConfig::default())
//!     .client(Arc::new(ScriptedClient::new()))
//!     .build()?;
//!
//! let ctx = RequestContext::builder("conversation-1", "introduction", "gpt-4o-mini").build();
//! let result = orchestrator.generate(&ctx, "We run a small bakery in Lyon.").await?;
//! println!("{}", result.text);
//! # Ok(())
//! # }
//! ```

pub mod assembly;
pub mod broker;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod orchestrator;
pub mod rate_limit;
pub mod retry;
pub mod tokens;
pub mod usage;

pub use assembly::MessageAssembler;
pub use broker::{ConnectionId, DisconnectCallback, StreamEvent, StreamingBroker, Transport, TransportError};
pub use cache::{CacheKey, CacheStats, ResponseCache, ResponseStore};
pub use config::{ConfigError, OrchestratorConfig, SectionConfig};
pub use context::{
    ConversationStore, GenerationResult, InMemoryConversationStore, NoPriorContext, RequestContext,
    RequestContextBuilder, StoreError,
};
pub use error::{OrchestratorError, Result};
pub use filter::ContentFilter;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use rate_limit::{FixedWindowLimiter, RateLimit, RateWindow};
pub use retry::{RetryError, RetryPolicy, RetryState};
pub use tokens::TokenAccountant;
pub use usage::{SessionUsage, UsageStore, UsageTracker};
