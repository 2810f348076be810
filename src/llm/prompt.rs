//! System prompts and response schemas, keyed by provider and engine.

use crate::db::DatabaseType;
use crate::llm::LlmProvider;
use std::collections::HashMap;

/// The JSON response contract appended to every system prompt.
const RESPONSE_SCHEMA: &str = r#"RESPONSE FORMAT:
Respond with a single JSON object, no markdown fences, matching:
{
  "assistantMessage": "markdown prose for the user (required)",
  "queries": [{
    "query": "the executable query text",
    "queryType": "SELECT | INSERT | UPDATE | DELETE | DDL | FIND | AGGREGATE",
    "tables": ["touched tables or collections"],
    "explanation": "one sentence on what the query does",
    "isCritical": true when the query mutates data or schema,
    "canRollback": true when a rollback is possible,
    "rollbackQuery": "concrete rollback text, or empty when it must be derived",
    "rollbackDependentQuery": "read-only query whose result is needed to build the rollback",
    "exampleResult": [{"sample": "row"}],
    "estimateResponseTime": "rough human estimate",
    "pagination": {
      "paginatedQuery": "variant with the literal token offset_size, only when the result may exceed 50 rows",
      "countQuery": "COUNT query for the total, only when paginatedQuery is set"
    }
  }],
  "actionButtons": [{"label": "...", "action": "...", "isPrimary": false}]
}

PAGINATION RULES:
- Only add pagination when the raw query may return more than 50 rows.
- A query with LIMIT below 50 must have empty paginatedQuery and empty countQuery.
- paginatedQuery must contain the literal placeholder offset_size exactly once.

SAFETY RULES:
- Mark every INSERT, UPDATE, DELETE, or DDL query isCritical: true.
- Provide rollbackQuery or rollbackDependentQuery whenever canRollback is true."#;

/// Registry of system prompts keyed by `(provider, db_type)`.
///
/// The built-in prompts are provider-neutral; the key includes the provider
/// so deployments can override per provider without forking the engine text.
pub struct PromptRegistry {
    prompts: HashMap<(LlmProvider, DatabaseType), String>,
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRegistry {
    /// Creates a registry with the built-in prompts for every provider and
    /// engine pairing.
    pub fn new() -> Self {
        let mut prompts = HashMap::new();
        for provider in [LlmProvider::OpenAi, LlmProvider::Gemini, LlmProvider::Mock] {
            for db_type in [
                DatabaseType::Postgres,
                DatabaseType::Yugabyte,
                DatabaseType::MySql,
                DatabaseType::ClickHouse,
                DatabaseType::MongoDb,
            ] {
                prompts.insert((provider, db_type), build_default_prompt(db_type));
            }
        }
        Self { prompts }
    }

    /// Returns the system prompt for the pairing.
    pub fn system_prompt(&self, provider: LlmProvider, db_type: DatabaseType) -> &str {
        self.prompts
            .get(&(provider, db_type))
            .map(String::as_str)
            // Registry is fully populated at construction; this is for
            // custom registrations that missed a pairing.
            .unwrap_or(RESPONSE_SCHEMA)
    }

    /// Overrides the prompt for one pairing.
    pub fn register(&mut self, provider: LlmProvider, db_type: DatabaseType, prompt: String) {
        self.prompts.insert((provider, db_type), prompt);
    }
}

fn build_default_prompt(db_type: DatabaseType) -> String {
    let engine_notes = match db_type {
        DatabaseType::Postgres => {
            "You are a PostgreSQL assistant. Generate valid PostgreSQL SQL. \
             Use ILIKE for case-insensitive matching and double quotes for \
             mixed-case identifiers."
        }
        DatabaseType::Yugabyte => {
            "You are a YugabyteDB assistant. YugabyteDB is PostgreSQL-compatible; \
             generate valid PostgreSQL SQL and prefer primary-key lookups, which \
             are distributed across tablets."
        }
        DatabaseType::MySql => {
            "You are a MySQL assistant. Generate valid MySQL SQL. Use backticks \
             for reserved-word identifiers and LIMIT/OFFSET for paging."
        }
        DatabaseType::ClickHouse => {
            "You are a ClickHouse assistant. Generate valid ClickHouse SQL. \
             For CREATE TABLE also provide engineType, partitionKey, and \
             orderByKey in the query entry. Prefer aggregations over row scans."
        }
        DatabaseType::MongoDb => {
            "You are a MongoDB assistant. Generate shell-style commands such as \
             db.collection.find({...}) or db.collection.aggregate([...]). Use \
             collections instead of tables in the query entries."
        }
    };

    format!(
        "{engine_notes}\n\n\
         The latest database schema, when available, is provided in a system \
         message. Ground every query in that schema; if the request cannot be \
         answered from it, say so in assistantMessage and return no queries. \
         Never invent destructive maintenance queries the user did not ask for.\n\n\
         {RESPONSE_SCHEMA}"
    )
}
