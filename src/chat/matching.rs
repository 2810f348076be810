//! Matching queries across the user-visible and LLM-visible views.
//!
//! The plan JSON the provider authored carries no stable ids, so the two
//! views correlate on the natural key `(query, queryType, explanation)`.
//! A user edit prefixes the LLM-view text with a literal marker; every
//! comparison strips that marker first.

use crate::model::Query;

/// Marker prepended to an edited query in the LLM view.
pub const EDITED_MARKER: &str = "EDITED by user: ";

/// Removes the edit marker, if present.
pub fn strip_edited_marker(text: &str) -> &str {
    text.strip_prefix(EDITED_MARKER).unwrap_or(text)
}

/// Prefixes the edit marker, guaranteeing it appears exactly once.
pub fn add_edited_marker(text: &str) -> String {
    format!("{EDITED_MARKER}{}", strip_edited_marker(text))
}

fn norm_query(text: &str) -> String {
    let stripped = strip_edited_marker(text.trim()).trim();
    // The two views can drift in whitespace only (the provider re-emits the
    // query in its JSON); collapse runs before comparing.
    match regex::Regex::new(r"\s+") {
        Ok(ws) => ws.replace_all(stripped, " ").into_owned(),
        Err(_) => stripped.to_string(),
    }
}

fn norm_type(query_type: Option<&str>) -> String {
    query_type.unwrap_or("").trim().to_uppercase()
}

/// Compares two `(query, queryType, explanation)` triples, marker-blind.
pub fn natural_key_eq(
    query_a: &str,
    type_a: Option<&str>,
    desc_a: &str,
    query_b: &str,
    type_b: Option<&str>,
    desc_b: &str,
) -> bool {
    norm_query(query_a) == norm_query(query_b)
        && norm_type(type_a) == norm_type(type_b)
        && desc_a.trim() == desc_b.trim()
}

/// Finds the plan entry matching a persisted query, in the raw plan JSON
/// stored on the mirror.
pub fn find_plan_query_mut<'a>(
    raw_plan: &'a mut serde_json::Value,
    query: &Query,
) -> Option<&'a mut serde_json::Value> {
    let entries = raw_plan.get_mut("queries")?.as_array_mut()?;
    entries.iter_mut().find(|entry| plan_entry_matches(entry, query))
}

/// Read-only variant of [`find_plan_query_mut`].
pub fn find_plan_query<'a>(
    raw_plan: &'a serde_json::Value,
    query: &Query,
) -> Option<&'a serde_json::Value> {
    let entries = raw_plan.get("queries")?.as_array()?;
    entries.iter().find(|entry| plan_entry_matches(entry, query))
}

fn plan_entry_matches(entry: &serde_json::Value, query: &Query) -> bool {
    let entry_query = entry.get("query").and_then(|v| v.as_str()).unwrap_or("");
    let entry_type = entry.get("queryType").and_then(|v| v.as_str());
    let entry_desc = entry
        .get("explanation")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    natural_key_eq(
        entry_query,
        entry_type,
        entry_desc,
        &query.query,
        query.query_type.as_deref(),
        &query.description,
    )
}
