//! OpenAI-compatible chat completions client.
//!
//! Works against any server implementing the `/chat/completions` endpoint
//! (hosted OpenAI, vLLM, LocalAI, LM Studio, Ollama's compatibility layer).
//! HTTP failures are mapped to [`UpstreamError`] variants here and nowhere
//! else.
//!
//! # Streaming
//!
//! [`UpstreamClient::complete_stream`] issues the same request with
//! `"stream": true` and parses the Server-Sent Events body into
//! [`StreamDelta`]s, one per content fragment, followed by a terminal delta.

use async_trait::async_trait;
use futures::Stream;
use quire_abstraction::{
    Completion, CompletionParams, CompletionStream, FinishReason, Message, StreamDelta,
    UpstreamClient, UpstreamError, Usage,
};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::env;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, error};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for an OpenAI-compatible completions endpoint.
#[derive(Debug, Clone)]
pub struct CompatibleClient {
    /// Base URL for the API (e.g., "https://api.openai.com/v1").
    base_url: String,
    /// Optional API key (local servers often run without auth).
    api_key: Option<String>,
    /// HTTP client for requests.
    client: Client,
}

impl CompatibleClient {
    /// Creates a client that reads its API key from `env_var`.
    ///
    /// # Errors
    /// Returns `UpstreamError::Unauthorized` if the variable is not set, or
    /// `UpstreamError::InvalidRequest` if the HTTP client cannot be built.
    #[allow(clippy::disallowed_methods)] // env::var is needed for API key loading
    pub fn from_env(base_url: impl Into<String>, env_var: &str) -> Result<Self, UpstreamError> {
        let api_key = env::var(env_var).map_err(|_| {
            UpstreamError::Unauthorized(format!("{env_var} environment variable not set"))
        })?;
        Self::build(base_url.into(), Some(api_key))
    }

    /// Creates a client with an explicit API key.
    ///
    /// # Errors
    /// Returns `UpstreamError::InvalidRequest` if the HTTP client cannot be built.
    pub fn with_api_key(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, UpstreamError> {
        Self::build(base_url.into(), Some(api_key.into()))
    }

    /// Creates a client that sends no `Authorization` header.
    ///
    /// # Errors
    /// Returns `UpstreamError::InvalidRequest` if the HTTP client cannot be built.
    pub fn without_auth(base_url: impl Into<String>) -> Result<Self, UpstreamError> {
        Self::build(base_url.into(), None)
    }

    fn build(base_url: String, api_key: Option<String>) -> Result<Self, UpstreamError> {
        // Per-attempt deadlines are enforced by the caller's retry policy, so
        // only the connect phase is bounded here.
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| UpstreamError::InvalidRequest(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), api_key, client })
    }

    /// The base URL requests are sent to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_body(messages: &[Message], params: &CompletionParams, stream: bool) -> ChatRequest {
        ChatRequest {
            model: params.model.clone(),
            messages: messages
                .iter()
                .map(|m| ChatMessage { role: m.role.as_str().to_string(), content: m.content.clone() })
                .collect(),
            stream,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            stop: params.stop_sequences.clone(),
        }
    }

    async fn send(
        &self,
        messages: &[Message],
        params: &CompletionParams,
        stream: bool,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(&Self::request_body(messages, params, stream));
        if let Some(ref api_key) = self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            error!(error = %e, url = %url, "Failed to send request to completions endpoint");
            map_transport_error(&e)
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = parse_retry_after(response.headers());
        let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        error!(
            status = %status,
            error = %error_text,
            url = %url,
            "Completions endpoint returned error status"
        );
        Err(UpstreamError::from_status(status.as_u16(), error_text, retry_after))
    }
}

#[async_trait]
impl UpstreamClient for CompatibleClient {
    async fn complete(
        &self,
        messages: &[Message],
        params: &CompletionParams,
    ) -> Result<Completion, UpstreamError> {
        debug!(
            model = %params.model,
            message_count = messages.len(),
            "CompatibleClient requesting completion"
        );

        let response = self.send(messages, params, false).await?;
        let body: ChatResponse = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse completions response");
            UpstreamError::MalformedResponse(format!("Failed to parse response: {e}"))
        })?;

        let choice = body.choices.into_iter().next().ok_or_else(|| {
            UpstreamError::MalformedResponse("No choices in API response".to_string())
        })?;

        Ok(Completion {
            text: choice.message.content,
            usage: body.usage.map(Into::into),
            finish_reason: choice
                .finish_reason
                .as_deref()
                .map_or(FinishReason::Unknown, FinishReason::parse),
            model: body.model,
        })
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        params: &CompletionParams,
    ) -> Result<CompletionStream, UpstreamError> {
        debug!(
            model = %params.model,
            message_count = messages.len(),
            "CompatibleClient opening completion stream"
        );

        let response = self.send(messages, params, true).await?;
        let stream: CompletionStream = Box::pin(SseStream::new(Box::pin(response.bytes_stream())));
        Ok(stream)
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

fn map_transport_error(e: &reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout(e.to_string())
    } else if e.is_builder() {
        UpstreamError::InvalidRequest(e.to_string())
    } else {
        UpstreamError::Network(e.to_string())
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

/// Parser turning an SSE body into deltas.
struct SseStream {
    inner: ByteStream,
    buffer: Vec<u8>,
    pending: VecDeque<Result<StreamDelta, UpstreamError>>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
    saw_done: bool,
    exhausted: bool,
}

impl SseStream {
    fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            finish_reason: None,
            usage: None,
            saw_done: false,
            exhausted: false,
        }
    }

    /// Parses every complete event currently in the buffer.
    fn drain_events(&mut self) {
        while !self.saw_done {
            let Some((end, separator)) = find_event_end(&self.buffer) else { break };
            let event: Vec<u8> = self.buffer.drain(..end + separator).collect();
            self.handle_event(&event[..end]);
        }
    }

    fn handle_event(&mut self, raw: &[u8]) {
        let event = match std::str::from_utf8(raw) {
            Ok(event) => event,
            Err(e) => {
                self.pending.push_back(Err(UpstreamError::MalformedResponse(format!(
                    "Failed to decode SSE event: {e}"
                ))));
                self.saw_done = true;
                return;
            }
        };

        for line in event.lines() {
            let Some(data) = line.trim_end_matches('\r').strip_prefix("data:") else { continue };
            let data = data.trim();

            if data == "[DONE]" {
                self.finish();
                return;
            }

            match serde_json::from_str::<ChatStreamChunk>(data) {
                Ok(chunk) => {
                    if let Some(usage) = chunk.usage {
                        self.usage = Some(usage.into());
                    }
                    if let Some(choice) = chunk.choices.into_iter().next() {
                        if let Some(reason) = choice.finish_reason.as_deref() {
                            self.finish_reason = Some(FinishReason::parse(reason));
                        }
                        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                            self.pending.push_back(Ok(StreamDelta::text(content)));
                        }
                    }
                }
                Err(e) => {
                    // Some servers send keep-alive or vendor-specific events.
                    debug!("Skipping unparseable SSE chunk: {}", e);
                }
            }
        }
    }

    fn finish(&mut self) {
        if !self.saw_done {
            self.saw_done = true;
            self.pending.push_back(Ok(StreamDelta::finish(
                self.finish_reason.unwrap_or(FinishReason::Stop),
                self.usage,
            )));
        }
    }
}

/// Position and length of the first blank-line separator (`\n\n` or `\r\n\r\n`).
fn find_event_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|end| (end, 2));
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|end| (end, 4));
    match (lf, crlf) {
        (Some(lf), Some(crlf)) => Some(if crlf.0 < lf.0 { crlf } else { lf }),
        (lf, crlf) => lf.or(crlf),
    }
}

impl Stream for SseStream {
    type Item = Result<StreamDelta, UpstreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if self.saw_done || self.exhausted {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.buffer.extend_from_slice(&bytes);
                    self.drain_events();
                }
                Poll::Ready(Some(Err(e))) => {
                    self.exhausted = true;
                    return Poll::Ready(Some(Err(UpstreamError::Network(format!("Stream error: {e}")))));
                }
                Poll::Ready(None) => {
                    self.exhausted = true;
                    self.drain_events();
                    if !self.saw_done && !self.buffer.is_empty() {
                        let rest = std::mem::take(&mut self.buffer);
                        self.handle_event(&rest);
                    }
                    if self.finish_reason.is_none() && !self.saw_done {
                        self.finish_reason = Some(FinishReason::Unknown);
                    }
                    self.finish();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// OpenAI-compatible request/response structures

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[allow(clippy::struct_field_names)] // Matches API naming
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ChatUsage> for Usage {
    fn from(u: ChatUsage) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    #[serde(default)]
    delta: ChatStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatStreamDelta {
    #[serde(default)]
    content: Option<String>,
}
