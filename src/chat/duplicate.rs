//! Chat duplication.
//!
//! Copies a chat and, optionally, its conversation: creation order is
//! preserved by rewriting timestamps with one-second increments,
//! `userMessageId` links are remapped through an id-translation table, and
//! every copied query gets a fresh id with execution state reset.

use crate::error::Result;
use crate::model::{Chat, LlmContent, Message, MessageType};
use crate::persistence::{llm_messages, messages};
use crate::store::MessageStore;
use std::collections::HashMap;
use tracing::info;

/// Duplicates `chat_id` for its owner.
pub async fn duplicate_chat(
    store: &MessageStore,
    user_id: &str,
    chat_id: i64,
    with_messages: bool,
) -> Result<Chat> {
    let source = store.get_owned_chat(chat_id, user_id).await?;

    let copy = store
        .create_chat(
            user_id,
            &source.connection,
            &source.selected_collections,
            source.settings,
        )
        .await?;

    if with_messages {
        copy_messages(store, &source, &copy).await?;
    }

    info!(source = source.id, copy = copy.id, with_messages, "chat duplicated");
    Ok(copy)
}

async fn copy_messages(store: &MessageStore, source: &Chat, copy: &Chat) -> Result<()> {
    let pool = store.state().pool();
    let base = store.now_utc().await?;

    // Schema context carries over: the copy points at the same database.
    for row in llm_messages::list_llm_messages(pool, source.id).await? {
        if let LlmContent::System { schema_update } = &row.content {
            llm_messages::insert_llm_message(
                pool,
                copy.id,
                None,
                &LlmContent::System {
                    schema_update: schema_update.clone(),
                },
                false,
            )
            .await?;
        }
    }

    let originals: Vec<Message> = store
        .list_messages(source.id)
        .await?
        .into_iter()
        .filter(|m| matches!(m.message_type, MessageType::User | MessageType::Assistant))
        .collect();

    let mut id_map: HashMap<i64, i64> = HashMap::new();

    for (index, original) in originals.iter().enumerate() {
        // User messages precede their assistant replies in creation order,
        // so the translation table is always populated before lookup.
        let user_message_id = original
            .user_message_id
            .and_then(|old| id_map.get(&old).copied());

        let copied = messages::insert_message_at(
            pool,
            messages::NewMessage {
                chat_id: copy.id,
                user_id: copy.user_id.clone(),
                message_type: Some(original.message_type),
                content: original.content.clone(),
                user_message_id,
                ..Default::default()
            },
            &base,
            index as i64,
        )
        .await?;
        id_map.insert(original.id, copied.id);

        if let Some(queries) = &original.queries {
            let fresh: Vec<_> = queries
                .iter()
                .enumerate()
                .map(|(idx, q)| {
                    let mut query = q.clone();
                    query.id = format!("{}:q{}", copied.id, idx);
                    query.reset_execution_state();
                    query
                })
                .collect();
            let buttons = crate::chat::buttons::derive_action_buttons(
                original.action_buttons.clone(),
                Some(&fresh),
            );
            messages::update_queries(pool, copied.id, &Some(fresh), &buttons).await?;
        }

        if let Some(mirror) = llm_messages::get_by_message_id(pool, original.id).await? {
            let content = match mirror.content {
                LlmContent::Assistant {
                    mut assistant_response,
                } => {
                    scrub_plan_execution(&mut assistant_response);
                    LlmContent::Assistant { assistant_response }
                }
                other => other,
            };
            llm_messages::insert_llm_message_at(
                pool,
                copy.id,
                Some(copied.id),
                &content,
                mirror.is_edited,
                &base,
                index as i64,
            )
            .await?;
        }
    }

    Ok(())
}

/// Clears execution state from a copied plan's query entries.
fn scrub_plan_execution(raw_plan: &mut serde_json::Value) {
    let Some(entries) = raw_plan.get_mut("queries").and_then(|v| v.as_array_mut()) else {
        return;
    };
    for entry in entries {
        if let Some(object) = entry.as_object_mut() {
            object.remove("isExecuted");
            object.remove("isRolledBack");
            object.remove("executionResult");
            object.remove("executionTime");
            object.remove("error");
            if let Some(pagination) = object.get_mut("pagination").and_then(|p| p.as_object_mut())
            {
                pagination.remove("totalRecordsCount");
            }
        }
    }
}
