//! Quire CLI - command-line front end for the Quire orchestrator
//!
//! Provides a `quire` command that runs one-shot or streaming generations
//! against an OpenAI-compatible endpoint (or an offline mock) and validates
//! configuration files.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use commands::generate::GenerateArgs;

/// Quire - guided document generation with bounded, resilient AI calls
#[derive(Parser, Debug)]
#[command(name = "quire", author, version, about = "Quire - AI request orchestration for guided writing")]
struct Args {
    /// Path to a TOML configuration file (defaults are used when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level for Quire crates (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate text for one section of a conversation
    Generate(GenerateArgs),

    /// Load and validate a configuration file, printing a JSON summary
    CheckConfig,
}

fn init_tracing(log_level: Option<&str>) {
    let fallback = log_level.map_or_else(|| "warn,quire=info".to_string(), |level| format!("warn,quire={level}"));
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        // stdout carries generated text; logs go to stderr.
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    match args.command {
        Command::Generate(generate) => commands::generate::execute(args.config.as_deref(), generate).await,
        Command::CheckConfig => commands::check_config::execute(args.config.as_deref()),
    }
}
