//! Generate command implementation.

use anyhow::{Context, Result, bail};
use clap::Args;
use quire_abstraction::UpstreamClient;
use quire_models::{CompatibleClient, ScriptedClient};
use quire_orchestrator::{ConnectionId, GenerationResult, Orchestrator, RequestContext, StreamingBroker};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::stdout_transport::StdoutTransport;

/// Connection id the CLI attaches to the broker for its own output.
const STDOUT_CONNECTION: &str = "stdout";

/// Arguments for `quire generate`.
#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Conversation the request belongs to (rate limits and usage are per conversation)
    #[arg(long, default_value = "cli")]
    pub conversation: String,

    /// Document section being written
    #[arg(short, long)]
    pub section: String,

    /// The user's input for this section
    #[arg(short, long)]
    pub prompt: String,

    /// Model identifier sent upstream
    #[arg(short, long, default_value = "gpt-4o-mini")]
    pub model: String,

    /// Sampling temperature
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Completion token cap
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Print chunks as they arrive
    #[arg(long)]
    pub stream: bool,

    /// Use the offline echo model instead of a real endpoint
    #[arg(long)]
    pub mock: bool,

    /// Base URL of the OpenAI-compatible endpoint
    #[arg(long, default_value = "https://api.openai.com/v1")]
    pub base_url: String,

    /// Environment variable holding the API key
    #[arg(long, default_value = "OPENAI_API_KEY")]
    pub api_key_env: String,

    /// Print the full result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Execute the generate command.
pub async fn execute(config_path: Option<&Path>, args: GenerateArgs) -> Result<()> {
    let config = super::load_config(config_path)?;
    let client = build_client(&args)?;
    let transport = Arc::new(StdoutTransport::new(args.json));
    let broker = StreamingBroker::new(transport.clone(), config.broker.connection_buffer);
    let orchestrator = Orchestrator::builder(config).client(client).broker(broker.clone()).build()?;

    let mut builder = RequestContext::builder(&args.conversation, &args.section, &args.model).streaming(args.stream);
    if let Some(temperature) = args.temperature {
        builder = builder.temperature(temperature);
    }
    if let Some(max_tokens) = args.max_tokens {
        builder = builder.max_tokens(max_tokens);
    }
    let ctx = builder.build();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling request");
            on_interrupt.cancel();
        }
    });

    let result = if ctx.streaming() {
        broker.attach(ConnectionId::from(STDOUT_CONNECTION), ctx.conversation_id());
        stream(&orchestrator, &ctx, &args.prompt, &cancel, &transport).await?
    } else {
        let result = orchestrator.generate_with_cancel(&ctx, &args.prompt, &cancel).await?;
        if !args.json {
            println!("{}", result.text);
        }
        result
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    debug!(
        prompt_tokens = result.usage.prompt_tokens,
        completion_tokens = result.usage.completion_tokens,
        fallback = result.fallback,
        "Generation finished"
    );
    Ok(())
}

fn build_client(args: &GenerateArgs) -> Result<Arc<dyn UpstreamClient>> {
    if args.mock {
        return Ok(Arc::new(ScriptedClient::new()));
    }
    if args.base_url.trim().is_empty() {
        bail!("--base-url must not be empty");
    }
    let client = CompatibleClient::from_env(&args.base_url, &args.api_key_env)
        .with_context(|| format!("Cannot create client for {}", args.base_url))?;
    Ok(Arc::new(client))
}

/// Streams through the broker, which prints via [`StdoutTransport`].
///
/// The caller-side sink is only drained; the room connection is what the user sees.
async fn stream(
    orchestrator: &Orchestrator,
    ctx: &RequestContext,
    prompt: &str,
    cancel: &CancellationToken,
    transport: &StdoutTransport,
) -> Result<GenerationResult> {
    let (sink, mut events) = mpsc::channel(64);
    let drain = tokio::spawn(async move { while events.recv().await.is_some() {} });

    let outcome = orchestrator.respond(ctx, prompt, &sink, cancel).await;
    drop(sink);
    drain.await.context("Stream drain task failed")?;

    let result = outcome?;
    // Successful streams always end with a broadcast Complete event.
    transport.finished().await;
    Ok(result)
}
