//! Disallowed-content screening.

use crate::config::{ConfigError, FilterRule};
use crate::error::{OrchestratorError, Result};
use regex::{Regex, RegexBuilder};
use tracing::warn;

/// Compiled rule set applied to user input before any upstream call.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    rules: Vec<(String, Regex)>,
}

impl ContentFilter {
    /// Compiles `rules`, case-insensitively.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidRule` for the first pattern that does not compile.
    pub fn new(rules: &[FilterRule]) -> std::result::Result<Self, ConfigError> {
        let rules = rules
            .iter()
            .map(|rule| {
                RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|regex| (rule.name.clone(), regex))
                    .map_err(|e| ConfigError::InvalidRule { name: rule.name.clone(), reason: e.to_string() })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// A filter that admits everything.
    #[must_use]
    pub fn permissive() -> Self {
        Self { rules: Vec::new() }
    }

    /// Name of the first rule `text` matches, if any.
    #[must_use]
    pub fn first_match(&self, text: &str) -> Option<&str> {
        self.rules.iter().find(|(_, regex)| regex.is_match(text)).map(|(name, _)| name.as_str())
    }

    /// Fails with `ContentRejected` when `text` matches a rule.
    pub fn check(&self, text: &str) -> Result<()> {
        match self.first_match(text) {
            Some(rule) => {
                warn!(rule, "Input rejected by content filter");
                Err(OrchestratorError::ContentRejected { rule: rule.to_string() })
            }
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
