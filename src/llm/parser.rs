//! Validation of provider responses into assistant plans.
//!
//! Providers are asked for a bare JSON object but some wrap it in markdown
//! fences or prepend prose; the parser peels that off before validating.

use crate::error::{ChatDbError, Result};
use crate::llm::plan::AssistantPlan;

/// A validated plan plus the exact JSON it was parsed from.
///
/// The raw value is what the LLM-visible mirror stores, so later turns see
/// the provider's own words rather than a re-serialization.
#[derive(Debug, Clone)]
pub struct ParsedPlan {
    pub plan: AssistantPlan,
    pub raw: serde_json::Value,
}

/// Parses and validates a provider response.
///
/// Fails with an upstream-LLM error when no JSON object can be extracted or
/// when the required `assistantMessage` field is missing or empty.
pub fn parse_plan(response: &str) -> Result<ParsedPlan> {
    let candidate = extract_json_object(response).ok_or_else(|| {
        ChatDbError::upstream_llm("Response does not contain a JSON object")
    })?;

    let raw: serde_json::Value = serde_json::from_str(candidate)
        .map_err(|e| ChatDbError::upstream_llm(format!("Response is not valid JSON: {e}")))?;

    if !raw.is_object() {
        return Err(ChatDbError::upstream_llm("Response JSON is not an object"));
    }

    let plan: AssistantPlan = serde_json::from_value(raw.clone())
        .map_err(|e| ChatDbError::upstream_llm(format!("Response does not match schema: {e}")))?;

    if plan.assistant_message.trim().is_empty() {
        return Err(ChatDbError::upstream_llm(
            "Response is missing assistantMessage",
        ));
    }

    Ok(ParsedPlan { plan, raw })
}

/// Extracts the JSON object from a response that may be fenced or padded
/// with prose.
fn extract_json_object(response: &str) -> Option<&str> {
    let trimmed = response.trim();

    // Prefer a fenced block when present.
    if let Some(fenced) = extract_fenced_block(trimmed) {
        return Some(fenced);
    }

    // Otherwise take the outermost brace span.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&trimmed[start..=end])
}

fn extract_fenced_block(text: &str) -> Option<&str> {
    let start_fence = if let Some(idx) = text.find("```json") {
        idx + "```json".len()
    } else if let Some(idx) = text.find("```") {
        idx + "```".len()
    } else {
        return None;
    };

    let rest = &text[start_fence..];
    let end = rest.find("```")?;
    let block = rest[..end].trim();
    if block.starts_with('{') {
        Some(block)
    } else {
        None
    }
}
