//! Prompt assembly from section templates.

use crate::config::SectionConfig;
use crate::context::RequestContext;
use quire_abstraction::Message;
use serde_json::Value;
use std::collections::HashMap;

/// Builds the ordered message list for a request.
///
/// Order is fixed: the section's system prompt, its few-shot examples, an
/// optional summary of earlier sections, then the user's input.
#[derive(Debug, Clone, Default)]
pub struct MessageAssembler {
    sections: HashMap<String, SectionConfig>,
}

impl MessageAssembler {
    #[must_use]
    pub fn new(sections: HashMap<String, SectionConfig>) -> Self {
        Self { sections }
    }

    /// Assembles messages for `input`.
    ///
    /// `stored_context` comes from the conversation store; it is combined
    /// with any prior-context payload carried by `ctx`.
    #[must_use]
    pub fn assemble(&self, ctx: &RequestContext, stored_context: Option<&str>, input: &str) -> Vec<Message> {
        let section = self.sections.get(ctx.section_id());
        let mut messages = Vec::new();

        let system_prompt = section
            .map(|s| s.system_prompt.trim())
            .filter(|p| !p.is_empty())
            .map_or_else(|| default_system_prompt(ctx.section_id()), str::to_string);
        messages.push(Message::system(system_prompt));

        if let Some(section) = section {
            for example in &section.examples {
                messages.push(Message::user(example.user.clone()));
                messages.push(Message::assistant(example.assistant.clone()));
            }
        }

        let summary: Vec<String> = stored_context
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .into_iter()
            .chain(render_payload(ctx.prior_context()))
            .collect();
        if !summary.is_empty() {
            messages.push(Message::user(format!("Context from earlier sections:\n{}", summary.join("\n"))));
        }

        messages.push(Message::user(input));
        messages
    }
}

fn default_system_prompt(section_id: &str) -> String {
    format!(
        "You are a writing assistant helping the user draft a structured document. \
         The current section is \"{section_id}\". Ask focused questions and keep answers concise."
    )
}

/// Flattens a JSON payload into readable lines; `None` when there is nothing to say.
fn render_payload(value: &Value) -> Option<String> {
    let rendered = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Object(map) => map
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}: {s}"),
                other => format!("{k}: {other}"),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Array(items) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => format!("- {s}"),
                other => format!("- {other}"),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    };
    (!rendered.is_empty()).then_some(rendered)
}
