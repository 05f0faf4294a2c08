//! Token estimation and prompt truncation.
//!
//! Estimates are word counts scaled by a per-model multiplier. They are
//! deliberately approximate but monotone: a prefix of a text never estimates
//! higher than the text itself, which the truncation search relies on.

use crate::config::BudgetConfig;
use quire_abstraction::{Message, Role};

/// Estimates prompt sizes and trims message lists to fit a budget.
#[derive(Debug, Clone)]
pub struct TokenAccountant {
    default_multiplier: f64,
    /// Sorted longest prefix first so the most specific match wins.
    model_multipliers: Vec<(String, f64)>,
}

impl Default for TokenAccountant {
    fn default() -> Self {
        Self::from_config(&BudgetConfig::default())
    }
}

impl TokenAccountant {
    /// Creates an accountant using `default_multiplier` tokens per word.
    #[must_use]
    pub fn new(default_multiplier: f64) -> Self {
        Self { default_multiplier, model_multipliers: Vec::new() }
    }

    /// Builds an accountant from budget configuration.
    #[must_use]
    pub fn from_config(config: &BudgetConfig) -> Self {
        config
            .model_multipliers
            .iter()
            .fold(Self::new(config.default_multiplier), |acc, (prefix, m)| acc.with_model_multiplier(prefix.clone(), *m))
    }

    /// Uses `multiplier` for models whose name starts with `prefix`.
    #[must_use]
    pub fn with_model_multiplier(mut self, prefix: impl Into<String>, multiplier: f64) -> Self {
        self.model_multipliers.push((prefix.into(), multiplier));
        self.model_multipliers.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        self
    }

    /// Tokens-per-word multiplier applied to `model`.
    #[must_use]
    pub fn multiplier_for(&self, model: &str) -> f64 {
        self.model_multipliers
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix.as_str()))
            .map_or(self.default_multiplier, |(_, m)| *m)
    }

    /// Estimated token count of `text` for `model`, rounded up.
    #[must_use]
    pub fn estimate(&self, text: &str, model: &str) -> u32 {
        let words = text.split_whitespace().count();
        if words == 0 {
            return 0;
        }
        let tokens = (words as f64 * self.multiplier_for(model)).ceil();
        // Saturate rather than wrap for absurdly long inputs.
        if tokens >= f64::from(u32::MAX) { u32::MAX } else { tokens as u32 }
    }

    /// Sum of the estimates of every message's content.
    #[must_use]
    pub fn estimate_messages(&self, messages: &[Message], model: &str) -> u32 {
        messages.iter().fold(0u32, |sum, m| sum.saturating_add(self.estimate(&m.content, model)))
    }

    /// Shortens `text` to at most `max_tokens`.
    ///
    /// Cuts at the last sentence boundary that fits; if no sentence fits,
    /// cuts at the longest character prefix that does. The result is
    /// trimmed of trailing whitespace and may be empty.
    #[must_use]
    pub fn truncate_text(&self, text: &str, max_tokens: u32, model: &str) -> String {
        if self.estimate(text, model) <= max_tokens {
            return text.to_string();
        }
        if max_tokens == 0 {
            return String::new();
        }

        let fits = |end: usize| self.estimate(&text[..end], model) <= max_tokens;

        let sentence_cut = sentence_ends(text).into_iter().take_while(|&end| fits(end)).last();
        if let Some(end) = sentence_cut {
            return text[..end].trim_end().to_string();
        }

        // Hard cut: binary search the longest char-aligned prefix that fits.
        let boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).chain(std::iter::once(text.len())).collect();
        let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
        while lo < hi {
            let mid = (lo + hi).div_ceil(2);
            if fits(boundaries[mid]) {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        text[..boundaries[lo]].trim_end().to_string()
    }

    /// Trims `messages` so their estimate is at most `budget`.
    ///
    /// System messages and the final message are never touched. Other
    /// messages are dropped or truncated oldest first, and a message that
    /// truncates to nothing is dropped. If the preserved messages alone exceed
    /// the budget the result still exceeds it; callers must check.
    #[must_use]
    pub fn truncate_to_budget(&self, messages: &[Message], budget: u32, model: &str) -> Vec<Message> {
        let mut total = self.estimate_messages(messages, model);
        if total <= budget {
            return messages.to_vec();
        }

        let last = messages.len().saturating_sub(1);
        let mut kept: Vec<Option<Message>> = messages.iter().cloned().map(Some).collect();

        for (index, slot) in kept.iter_mut().enumerate() {
            if total <= budget {
                break;
            }
            let Some(message) = slot.as_mut() else { continue };
            if index == last || message.role == Role::System {
                continue;
            }

            let tokens = self.estimate(&message.content, model);
            let excess = total - budget;
            if tokens <= excess {
                total -= tokens;
                *slot = None;
                continue;
            }

            let truncated = self.truncate_text(&message.content, tokens - excess, model);
            total = total - tokens + self.estimate(&truncated, model);
            if truncated.is_empty() {
                *slot = None;
            } else {
                message.content = truncated;
            }
        }

        kept.into_iter().flatten().collect()
    }
}

/// Byte offsets just past each sentence terminator, in ascending order.
fn sentence_ends(text: &str) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((i, ch)) = chars.next() {
        if matches!(ch, '.' | '!' | '?') {
            let at_boundary = chars.peek().is_none_or(|(_, next)| next.is_whitespace());
            if at_boundary {
                ends.push(i + ch.len_utf8());
            }
        }
    }
    ends
}
