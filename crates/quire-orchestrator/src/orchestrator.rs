//! The request pipeline: admission, caching, screening, assembly, budgeting,
//! resilient upstream calls and streaming delivery.

use crate::assembly::MessageAssembler;
use crate::broker::{StreamEvent, StreamingBroker};
use crate::cache::{CacheKey, CacheStats, ResponseCache, ResponseStore};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::context::{ConversationStore, GenerationResult, NoPriorContext, RequestContext};
use crate::error::{OrchestratorError, Result};
use crate::filter::ContentFilter;
use crate::rate_limit::{FixedWindowLimiter, RateLimit};
use crate::retry::{RetryError, RetryPolicy};
use crate::tokens::TokenAccountant;
use crate::usage::{SessionUsage, UsageStore, UsageTracker};
use chrono::Utc;
use futures::StreamExt;
use quire_abstraction::{CompletionParams, FinishReason, Message, UpstreamClient, UpstreamError, Usage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// A request that passed admission and is ready for the upstream.
struct PreparedRequest {
    cache_key: Option<CacheKey>,
    messages: Vec<Message>,
    params: CompletionParams,
    prompt_tokens: u32,
}

enum Prepared {
    Cached(GenerationResult),
    Request(PreparedRequest),
}

/// Turns a request context and user input into a generation.
///
/// Shared state lives behind the injected stores, so one orchestrator can
/// serve many conversations concurrently; wrap it in an `Arc` to share it.
pub struct Orchestrator {
    client: Arc<dyn UpstreamClient>,
    cache: Arc<dyn ResponseStore>,
    limiter: Arc<dyn RateLimit>,
    usage: Arc<dyn UsageStore>,
    conversations: Arc<dyn ConversationStore>,
    broker: Option<StreamingBroker>,
    accountant: TokenAccountant,
    filter: ContentFilter,
    assembler: MessageAssembler,
    retry: RetryPolicy,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("client", &self.client.name())
            .field("broker", &self.broker)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Wires an [`Orchestrator`] from configuration and injected stores.
///
/// Only the upstream client is required; every store defaults to its
/// in-memory implementation.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    client: Option<Arc<dyn UpstreamClient>>,
    cache: Option<Arc<dyn ResponseStore>>,
    limiter: Option<Arc<dyn RateLimit>>,
    usage: Option<Arc<dyn UsageStore>>,
    conversations: Option<Arc<dyn ConversationStore>>,
    broker: Option<StreamingBroker>,
}

impl OrchestratorBuilder {
    #[must_use]
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config, client: None, cache: None, limiter: None, usage: None, conversations: None, broker: None }
    }

    #[must_use]
    pub fn client(mut self, client: Arc<dyn UpstreamClient>) -> Self {
        self.client = Some(client);
        self
    }

    #[must_use]
    pub fn response_store(mut self, cache: Arc<dyn ResponseStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimit>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn usage_store(mut self, usage: Arc<dyn UsageStore>) -> Self {
        self.usage = Some(usage);
        self
    }

    #[must_use]
    pub fn conversation_store(mut self, conversations: Arc<dyn ConversationStore>) -> Self {
        self.conversations = Some(conversations);
        self
    }

    /// Broadcasts streaming output to the conversation's room.
    #[must_use]
    pub fn broker(mut self, broker: StreamingBroker) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Validates the configuration and builds the orchestrator.
    ///
    /// # Errors
    /// Returns `OrchestratorError::Config` for invalid settings or a missing client.
    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;
        let client = self.client.ok_or(ConfigError::MissingClient)?;
        let filter = ContentFilter::new(&config.filter.rules)?;

        Ok(Orchestrator {
            client,
            cache: self.cache.unwrap_or_else(|| Arc::new(ResponseCache::new())),
            limiter: self.limiter.unwrap_or_else(|| Arc::new(FixedWindowLimiter::from_config(&config.rate_limit))),
            usage: self.usage.unwrap_or_else(|| Arc::new(UsageTracker::new())),
            conversations: self.conversations.unwrap_or_else(|| Arc::new(NoPriorContext)),
            broker: self.broker,
            accountant: TokenAccountant::from_config(&config.budget),
            filter,
            assembler: MessageAssembler::new(config.sections.clone()),
            retry: RetryPolicy::from_config(&config.upstream),
            config,
        })
    }
}

impl Orchestrator {
    /// Starts a builder.
    #[must_use]
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Generates a complete response.
    ///
    /// # Errors
    /// See [`Orchestrator::generate_with_cancel`].
    pub async fn generate(&self, ctx: &RequestContext, input: &str) -> Result<GenerationResult> {
        self.generate_with_cancel(ctx, input, &CancellationToken::new()).await
    }

    /// Generates a complete response, giving up when `cancel` fires.
    ///
    /// A cancelled call writes nothing to the cache or the usage store.
    ///
    /// # Errors
    /// `RateLimitExceeded`, `ContentRejected` and `BudgetUnsatisfiable` before
    /// any upstream call; `UpstreamNonRetriable` or `UpstreamRetriable` when the
    /// upstream fails and no fallback applies; `Cancelled`; `ContextUnavailable`.
    pub async fn generate_with_cancel(
        &self,
        ctx: &RequestContext,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        let span = info_span!(
            "generate",
            conversation_id = %ctx.conversation_id(),
            section_id = %ctx.section_id(),
            model = %ctx.model(),
            streaming = ctx.streaming()
        );
        self.run_generate(ctx, input, cancel).instrument(span).await
    }

    async fn run_generate(
        &self,
        ctx: &RequestContext,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        if ctx.streaming() {
            debug!("Streaming context served as a single response");
        }
        let request = match self.prepare(ctx, input).await? {
            Prepared::Cached(result) => return Ok(result),
            Prepared::Request(request) => request,
        };

        let client = &self.client;
        let messages = request.messages.as_slice();
        let params = &request.params;
        let outcome = self.retry.execute(cancel, move |_| client.complete(messages, params)).await;

        match outcome {
            Ok(completion) => {
                if cancel.is_cancelled() {
                    return Err(OrchestratorError::Cancelled);
                }
                let result = self.completed_result(
                    ctx,
                    &request,
                    completion.text,
                    completion.finish_reason,
                    completion.usage,
                    completion.model,
                );
                self.record_success(ctx, request.cache_key, &result);
                Ok(result)
            }
            Err(error) => {
                let fallback = self.resolve_failure(ctx, error)?;
                self.usage.record(ctx.conversation_id(), &fallback.usage, true);
                Ok(fallback)
            }
        }
    }

    /// Generates a response chunk by chunk.
    ///
    /// Every chunk goes to `sink` and to the conversation's room, followed by
    /// a terminal `Complete` or `Error` event. A dropped `sink` receiver counts
    /// as cancellation; room observers then receive an error event.
    ///
    /// # Errors
    /// As [`Orchestrator::generate_with_cancel`], plus `StreamInterrupted` when
    /// the upstream stream breaks after it opened.
    pub async fn stream(
        &self,
        ctx: &RequestContext,
        input: &str,
        sink: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        let span = info_span!(
            "stream",
            conversation_id = %ctx.conversation_id(),
            section_id = %ctx.section_id(),
            model = %ctx.model(),
            streaming = ctx.streaming()
        );
        self.run_stream(ctx, input, sink, cancel).instrument(span).await
    }

    /// Serves `ctx` in the mode its streaming flag asks for.
    ///
    /// Streaming contexts go through [`Orchestrator::stream`]. Others go through
    /// [`Orchestrator::generate_with_cancel`] and leave `sink` untouched.
    ///
    /// # Errors
    /// As the selected mode.
    pub async fn respond(
        &self,
        ctx: &RequestContext,
        input: &str,
        sink: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        if ctx.streaming() {
            self.stream(ctx, input, sink, cancel).await
        } else {
            self.generate_with_cancel(ctx, input, cancel).await
        }
    }

    async fn run_stream(
        &self,
        ctx: &RequestContext,
        input: &str,
        sink: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        if !ctx.streaming() {
            debug!("Non-streaming context delivered chunk by chunk");
        }
        let request = match self.prepare(ctx, input).await? {
            Prepared::Cached(result) => {
                self.deliver_whole(ctx, sink, &result).await?;
                return Ok(result);
            }
            Prepared::Request(request) => request,
        };

        let client = &self.client;
        let messages = request.messages.as_slice();
        let params = &request.params;
        let opened = self.retry.execute(cancel, move |_| client.complete_stream(messages, params)).await;

        let mut upstream = match opened {
            Ok(upstream) => upstream,
            Err(error) => {
                return match self.resolve_failure(ctx, error) {
                    Ok(fallback) => {
                        self.deliver_whole(ctx, sink, &fallback).await?;
                        self.usage.record(ctx.conversation_id(), &fallback.usage, true);
                        Ok(fallback)
                    }
                    Err(err) => {
                        self.announce_error(ctx, sink, &err).await;
                        Err(err)
                    }
                };
            }
        };

        let idle_timeout = self.retry.attempt_timeout();
        let mut text = String::new();
        let mut sequence = 0u64;
        let mut finish_reason = FinishReason::Unknown;
        let mut usage = None;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(received = sequence, "Stream cancelled");
                    self.announce_error(ctx, sink, &OrchestratorError::Cancelled).await;
                    return Err(OrchestratorError::Cancelled);
                }
                next = tokio::time::timeout(idle_timeout, upstream.next()) => next,
            };
            let item = next.unwrap_or_else(|_| {
                Some(Err(UpstreamError::Timeout(format!(
                    "no stream output for {}ms",
                    idle_timeout.as_millis()
                ))))
            });

            match item {
                None => break,
                Some(Ok(delta)) => {
                    if !delta.delta.is_empty() {
                        text.push_str(&delta.delta);
                        let chunk = StreamEvent::Chunk {
                            conversation_id: ctx.conversation_id().to_string(),
                            sequence,
                            delta: delta.delta,
                        };
                        self.emit(ctx, sink, chunk).await?;
                        sequence += 1;
                    }
                    if let Some(reason) = delta.finish_reason {
                        finish_reason = reason;
                    }
                    if delta.usage.is_some() {
                        usage = delta.usage;
                    }
                    if delta.done {
                        break;
                    }
                }
                Some(Err(source)) => {
                    let err = OrchestratorError::StreamInterrupted { received: sequence, source };
                    warn!(received = sequence, error = %err, "Upstream stream interrupted");
                    self.announce_error(ctx, sink, &err).await;
                    return Err(err);
                }
            }
        }

        if cancel.is_cancelled() {
            self.announce_error(ctx, sink, &OrchestratorError::Cancelled).await;
            return Err(OrchestratorError::Cancelled);
        }

        let result = self.completed_result(ctx, &request, text, finish_reason, usage, None);
        let complete = StreamEvent::Complete { conversation_id: ctx.conversation_id().to_string(), result: result.clone() };
        self.emit(ctx, sink, complete).await?;
        self.record_success(ctx, request.cache_key, &result);
        debug!(chunks = sequence, "Stream complete");
        Ok(result)
    }

    /// Steps shared by both modes, up to the upstream call.
    async fn prepare(&self, ctx: &RequestContext, input: &str) -> Result<Prepared> {
        self.limiter.check(ctx.conversation_id())?;

        let cache_key = self.config.cache.enabled.then(|| {
            CacheKey::derive(
                input,
                ctx.section_id(),
                ctx.model(),
                ctx.temperature(),
                self.config.cache.key_prefix_chars,
            )
        });
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key) {
                info!(cache_hit = true, "Serving cached response");
                return Ok(Prepared::Cached(hit));
            }
            debug!(cache_hit = false, "Cache miss");
        }

        self.filter.check(input)?;

        let stored = self.conversations.prior_context(ctx.conversation_id()).await?;
        let mut messages = self.assembler.assemble(ctx, stored.as_deref(), input);

        let budget = self.config.section_budget(ctx.section_id());
        let mut prompt_tokens = self.accountant.estimate_messages(&messages, ctx.model());
        if prompt_tokens > budget {
            let target = ((f64::from(budget) * self.config.budget.headroom_ratio).floor() as u32).max(1);
            messages = self.accountant.truncate_to_budget(&messages, target, ctx.model());
            let truncated = self.accountant.estimate_messages(&messages, ctx.model());
            if truncated > budget {
                warn!(required = truncated, budget, "Prompt cannot fit the token budget");
                return Err(OrchestratorError::BudgetUnsatisfiable { required: truncated, budget });
            }
            info!(before = prompt_tokens, after = truncated, budget, "Truncated prompt to fit budget");
            prompt_tokens = truncated;
        }

        let params = CompletionParams {
            temperature: Some(ctx.temperature()),
            max_tokens: ctx.max_tokens(),
            ..CompletionParams::new(ctx.model())
        };

        Ok(Prepared::Request(PreparedRequest { cache_key, messages, params, prompt_tokens }))
    }

    fn completed_result(
        &self,
        ctx: &RequestContext,
        request: &PreparedRequest,
        text: String,
        finish_reason: FinishReason,
        usage: Option<Usage>,
        model: Option<String>,
    ) -> GenerationResult {
        let usage = usage.unwrap_or_else(|| Usage::new(request.prompt_tokens, self.accountant.estimate(&text, ctx.model())));
        GenerationResult {
            text,
            finish_reason,
            usage,
            timestamp: Utc::now(),
            fallback: false,
            model: model.unwrap_or_else(|| ctx.model().to_string()),
        }
    }

    fn record_success(&self, ctx: &RequestContext, cache_key: Option<CacheKey>, result: &GenerationResult) {
        if let Some(key) = cache_key {
            self.cache.set(key, result.clone(), self.config.cache.ttl());
            info!(cache_hit = false, ttl_secs = self.config.cache.ttl_secs, "Cached response");
        }
        self.usage.record(ctx.conversation_id(), &result.usage, false);
    }

    /// Maps a failed upstream call to an error, or to the section's fallback.
    fn resolve_failure(&self, ctx: &RequestContext, error: RetryError) -> Result<GenerationResult> {
        match error {
            RetryError::Cancelled { .. } => Err(OrchestratorError::Cancelled),
            RetryError::NonRetriable { error, .. } => Err(OrchestratorError::UpstreamNonRetriable(error)),
            RetryError::Exhausted { error, attempts } if error.is_fallback_eligible() => {
                warn!(attempts, error = %error, "Upstream unavailable, serving fallback");
                Ok(self.fallback_result(ctx))
            }
            RetryError::Exhausted { error, attempts } => {
                Err(OrchestratorError::UpstreamRetriable { attempts, source: error })
            }
        }
    }

    fn fallback_result(&self, ctx: &RequestContext) -> GenerationResult {
        GenerationResult {
            text: self.config.fallback_text(ctx.section_id()).to_string(),
            finish_reason: FinishReason::Fallback,
            usage: Usage::default(),
            timestamp: Utc::now(),
            fallback: true,
            model: ctx.model().to_string(),
        }
    }

    /// Sends a whole result as one chunk plus `Complete`.
    async fn deliver_whole(
        &self,
        ctx: &RequestContext,
        sink: &mpsc::Sender<StreamEvent>,
        result: &GenerationResult,
    ) -> Result<()> {
        let conversation_id = ctx.conversation_id().to_string();
        if !result.text.is_empty() {
            let chunk = StreamEvent::Chunk { conversation_id: conversation_id.clone(), sequence: 0, delta: result.text.clone() };
            self.emit(ctx, sink, chunk).await?;
        }
        self.emit(ctx, sink, StreamEvent::Complete { conversation_id, result: result.clone() }).await
    }

    /// Sends `event` to the caller, then to the room.
    ///
    /// If the caller has gone away the room is told the generation was
    /// cancelled and `Cancelled` is returned.
    async fn emit(&self, ctx: &RequestContext, sink: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Result<()> {
        let room_event = self.broker.is_some().then(|| event.clone());
        if sink.send(event).await.is_err() {
            debug!("Caller dropped the stream receiver");
            if let Some(broker) = &self.broker {
                broker.broadcast_error(
                    ctx.conversation_id(),
                    OrchestratorError::Cancelled.code(),
                    "The requesting client disconnected",
                );
            }
            return Err(OrchestratorError::Cancelled);
        }
        if let (Some(broker), Some(event)) = (&self.broker, room_event) {
            broker.broadcast(ctx.conversation_id(), &event);
        }
        Ok(())
    }

    async fn announce_error(&self, ctx: &RequestContext, sink: &mpsc::Sender<StreamEvent>, err: &OrchestratorError) {
        let event = StreamEvent::Error {
            conversation_id: ctx.conversation_id().to_string(),
            code: err.code().to_string(),
            message: err.to_string(),
        };
        if let Some(broker) = &self.broker {
            broker.broadcast(ctx.conversation_id(), &event);
        }
        if sink.send(event).await.is_err() {
            debug!("Caller dropped the stream receiver before the error event");
        }
    }

    /// Cumulative usage of a conversation.
    pub fn usage(&self, conversation_id: &str) -> Option<SessionUsage> {
        self.usage.get(conversation_id)
    }

    pub fn reset_usage(&self, conversation_id: &str) -> Option<SessionUsage> {
        self.usage.reset(conversation_id)
    }

    pub fn reset_rate_limit(&self, conversation_id: &str) {
        self.limiter.reset(conversation_id);
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Longest a single generation can spend waiting on the upstream to open.
    pub fn worst_case_latency(&self) -> Duration {
        self.retry.worst_case_duration()
    }

    pub fn broker(&self) -> Option<&StreamingBroker> {
        self.broker.as_ref()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Runs the cache sweep and idle rate-window eviction until `token` is cancelled.
    pub fn spawn_maintenance(&self, token: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        let limiter = Arc::clone(&self.limiter);
        let sweep_interval = self.config.cache.sweep_interval();
        let evict_interval = self.config.rate_limit.evict_interval();
        let max_idle = self.config.rate_limit.idle_evict();

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_interval);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut evict = tokio::time::interval(evict_interval);
            evict.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                sweep_interval_secs = sweep_interval.as_secs(),
                evict_interval_secs = evict_interval.as_secs(),
                "Maintenance started"
            );
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = sweep.tick() => {
                        cache.sweep();
                    }
                    _ = evict.tick() => {
                        limiter.evict_idle(max_idle);
                    }
                }
            }
            info!("Maintenance stopped");
        })
    }
}
