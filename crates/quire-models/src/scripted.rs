//! Scripted in-process client for tests, demos and offline runs.
//!
//! Each call consumes the next [`ScriptStep`]. Once the script is empty the
//! client echoes the last user message back, so a `ScriptedClient::new()`
//! behaves like a deterministic mock model.

use async_trait::async_trait;
use futures::StreamExt;
use quire_abstraction::{
    Completion, CompletionParams, CompletionStream, FinishReason, Message, Role, StreamDelta,
    UpstreamClient, UpstreamError, Usage,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// One scripted reaction to a call.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Succeed with this text.
    Reply(String),
    /// Fail the call (or the stream opening) with this error.
    Fail(UpstreamError),
    /// Stream these items; an `Err` item ends the stream mid-way.
    Stream(Vec<Result<String, UpstreamError>>),
    /// Never answer. Useful for exercising timeouts and cancellation.
    Hang,
}

/// A deterministic [`UpstreamClient`] driven by a queue of [`ScriptStep`]s.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<ScriptStep>>,
    requests: Mutex<Vec<Vec<Message>>>,
    calls: AtomicUsize,
    chunk_delay: Option<Duration>,
}

impl ScriptedClient {
    /// Creates a client with an empty script (echo mode).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a client that plays `steps` in order.
    #[must_use]
    pub fn with_script(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self { script: Mutex::new(steps.into_iter().collect()), ..Self::default() }
    }

    /// Sleeps for `delay` before each streamed item.
    #[must_use]
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Appends a step to the script.
    pub fn push(&self, step: ScriptStep) {
        lock(&self.script).push_back(step);
    }

    /// Number of calls received so far (both `complete` and `complete_stream`).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Message lists received so far, in call order.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        lock(&self.requests).clone()
    }

    fn next_step(&self, messages: &[Message]) -> ScriptStep {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(messages.to_vec());
        lock(&self.script).pop_front().unwrap_or_else(|| ScriptStep::Reply(echo(messages)))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn echo(messages: &[Message]) -> String {
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map_or("", |m| m.content.as_str());
    format!("Echo: {last_user}")
}

/// Count tokens in a string (simplified: word count).
fn count_tokens(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

fn usage_for(messages: &[Message], completion: &str) -> Usage {
    let prompt_tokens = messages.iter().map(|m| count_tokens(&m.content)).sum::<u32>();
    Usage::new(prompt_tokens, count_tokens(completion))
}

/// Splits text into word-sized chunks that concatenate back to the input.
fn split_words(text: &str) -> Vec<Result<String, UpstreamError>> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_whitespace() && !current.trim().is_empty() {
            chunks.push(Ok(std::mem::take(&mut current)));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(Ok(current));
    }
    chunks
}

#[async_trait]
impl UpstreamClient for ScriptedClient {
    async fn complete(
        &self,
        messages: &[Message],
        params: &CompletionParams,
    ) -> Result<Completion, UpstreamError> {
        let step = self.next_step(messages);
        debug!(model = %params.model, step = ?step, "ScriptedClient completing");

        let text = match step {
            ScriptStep::Reply(text) => text,
            ScriptStep::Fail(err) => return Err(err),
            ScriptStep::Stream(items) => items.into_iter().collect::<Result<String, _>>()?,
            ScriptStep::Hang => futures::future::pending::<String>().await,
        };

        Ok(Completion {
            usage: Some(usage_for(messages, &text)),
            text,
            finish_reason: FinishReason::Stop,
            model: Some(params.model.clone()),
        })
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        params: &CompletionParams,
    ) -> Result<CompletionStream, UpstreamError> {
        let step = self.next_step(messages);
        debug!(model = %params.model, step = ?step, "ScriptedClient opening stream");

        let items = match step {
            ScriptStep::Reply(text) => split_words(&text),
            ScriptStep::Fail(err) => return Err(err),
            ScriptStep::Stream(items) => items,
            ScriptStep::Hang => futures::future::pending::<Vec<_>>().await,
        };

        let completion: String = items.iter().filter_map(|i| i.as_ref().ok()).map(String::as_str).collect();
        let failed = items.iter().any(Result::is_err);
        let mut deltas: Vec<Result<StreamDelta, UpstreamError>> = Vec::with_capacity(items.len() + 1);
        for item in items {
            match item {
                Ok(text) => deltas.push(Ok(StreamDelta::text(text))),
                Err(err) => {
                    deltas.push(Err(err));
                    break;
                }
            }
        }
        if !failed {
            deltas.push(Ok(StreamDelta::finish(FinishReason::Stop, Some(usage_for(messages, &completion)))));
        }

        let delay = self.chunk_delay;
        let stream: CompletionStream = Box::pin(futures::stream::iter(deltas).then(move |item| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            item
        }));
        Ok(stream)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
