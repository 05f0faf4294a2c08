//! Command implementations for the Quire CLI.

pub mod check_config;
pub mod generate;
pub mod stdout_transport;

use anyhow::{Context, Result};
use quire_orchestrator::OrchestratorConfig;
use std::path::Path;

/// Loads `path`, or the defaults when no file was given. Either way the result is validated.
pub fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    match path {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => {
            let config = OrchestratorConfig::default();
            config.validate().context("Default configuration is invalid")?;
            Ok(config)
        }
    }
}
