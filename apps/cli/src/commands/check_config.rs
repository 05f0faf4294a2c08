//! Check-config command implementation.

use anyhow::Result;
use quire_orchestrator::{OrchestratorConfig, RetryPolicy};
use serde_json::json;
use std::path::Path;

/// Execute the check-config command.
pub fn execute(path: Option<&Path>) -> Result<()> {
    let config = super::load_config(path)?;
    println!("{}", serde_json::to_string_pretty(&summary(&config))?);
    Ok(())
}

fn summary(config: &OrchestratorConfig) -> serde_json::Value {
    let mut sections: Vec<&String> = config.sections.keys().collect();
    sections.sort();
    let worst_case = RetryPolicy::from_config(&config.upstream).worst_case_duration();

    json!({
        "valid": true,
        "sections": sections,
        "filter_rules": config.filter.rules.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
        "max_attempts": config.upstream.max_retries + 1,
        "worst_case_latency_ms": worst_case.as_millis() as u64,
        "rate_limit": {
            "quota": config.rate_limit.quota,
            "window_secs": config.rate_limit.window_secs,
            "block_secs": config.rate_limit.block_secs,
        },
        "cache": {
            "enabled": config.cache.enabled,
            "ttl_secs": config.cache.ttl_secs,
        },
        "default_prompt_tokens": config.budget.default_prompt_tokens,
    })
}
