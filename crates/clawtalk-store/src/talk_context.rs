//! Context block injected into managed agents before they start.

use crate::talk_model::{Talk, TalkMessage};

const CONTEXT_BLOCK_BUDGET_CHARS: usize = 2_048;

/// Renders the ~2 KB context block for a managed agent: instructions,
/// objective, active rules, context document, pins, and state paths.
pub fn build_talk_context_block(
    talk: &Talk,
    context_document: &str,
    pinned_messages: &[TalkMessage],
) -> String {
    let mut lines = Vec::new();
    lines.push("## Talk context".to_string());
    if !talk.topic_title.trim().is_empty() {
        lines.push(format!("Topic: {}", talk.topic_title.trim()));
    }
    if !talk.objective.trim().is_empty() {
        lines.push(format!("Objective: {}", talk.objective.trim()));
    }

    let active_rules = talk
        .directives
        .iter()
        .filter(|directive| directive.active)
        .collect::<Vec<_>>();
    if !active_rules.is_empty() {
        lines.push("Rules:".to_string());
        for directive in active_rules {
            lines.push(format!("- {}", directive.text.trim()));
        }
    }

    if !context_document.trim().is_empty() {
        lines.push("Context:".to_string());
        lines.push(context_document.trim().to_string());
    }

    if !pinned_messages.is_empty() {
        lines.push("Pinned:".to_string());
        for message in pinned_messages {
            lines.push(format!("- [{}] {}", message.role.as_str(), message.content.trim()));
        }
    }

    lines.push(format!(
        "State: talks/{id}/history.jsonl talks/{id}/context.md",
        id = talk.id
    ));

    let block = lines.join("\n");
    if block.chars().count() <= CONTEXT_BLOCK_BUDGET_CHARS {
        return block;
    }
    let truncated = block
        .chars()
        .take(CONTEXT_BLOCK_BUDGET_CHARS.saturating_sub(1))
        .collect::<String>();
    format!("{truncated}\u{2026}")
}
