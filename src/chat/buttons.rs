//! Action-button derivation.
//!
//! Buttons are derived state: `fix_error` exists exactly when some embedded
//! query carries a non-null error. Derivation is idempotent and runs after
//! every write to a query's error field.

use crate::model::{actions, ActionButton, Query};

/// Recomputes the button list for a message's queries.
///
/// LLM-proposed buttons (anything other than `fix_error`) are preserved;
/// `fix_error` is added or removed to match the persisted errors.
pub fn derive_action_buttons(
    existing: Option<Vec<ActionButton>>,
    queries: Option<&Vec<Query>>,
) -> Option<Vec<ActionButton>> {
    let mut buttons: Vec<ActionButton> = existing
        .unwrap_or_default()
        .into_iter()
        .filter(|b| b.action != actions::FIX_ERROR)
        .collect();

    let has_error = queries
        .map(|qs| qs.iter().any(|q| q.error.is_some()))
        .unwrap_or(false);

    if has_error {
        buttons.push(ActionButton::fix_error());
    }

    if buttons.is_empty() {
        None
    } else {
        Some(buttons)
    }
}
