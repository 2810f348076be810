//! Database schema types.
//!
//! Represents the structure of a user database, its LLM-facing text
//! rendering, selected-collection projection, and the diff emitted by
//! incremental refreshes.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

/// How many example rows the formatter includes per table.
const MAX_EXAMPLE_ROWS: usize = 3;

/// Represents the complete schema of a database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    /// All tables (or collections) in the schema.
    pub tables: Vec<Table>,
}

impl Schema {
    /// Creates a new empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the schema to the named tables.
    ///
    /// Unknown names are ignored; the relative order of kept tables is
    /// preserved.
    pub fn project(&self, selected: &[String]) -> Schema {
        let wanted: BTreeSet<&str> = selected.iter().map(String::as_str).collect();
        Schema {
            tables: self
                .tables
                .iter()
                .filter(|t| wanted.contains(t.name.as_str()))
                .cloned()
                .collect(),
        }
    }

    /// Formats the schema for inclusion in an LLM system prompt.
    ///
    /// First-time emissions include example rows; incremental refreshes
    /// pass `include_examples = false`.
    pub fn format_for_llm(&self, include_examples: bool) -> String {
        let tables_text = self
            .tables
            .iter()
            .map(|table| Self::format_table(table, include_examples))
            .collect::<Vec<_>>()
            .join("\n");

        format!("Database Schema:\n\n{}", tables_text)
    }

    fn format_table(table: &Table, include_examples: bool) -> String {
        let column_lines = table
            .columns
            .iter()
            .map(|column| Self::format_column(table, column))
            .collect::<Vec<_>>()
            .join("");

        let mut text = format!("Table: {}\n{}", table.name, column_lines);

        if include_examples && !table.example_rows.is_empty() {
            let examples = table
                .example_rows
                .iter()
                .take(MAX_EXAMPLE_ROWS)
                .filter_map(|row| serde_json::to_string(row).ok())
                .map(|row| format!("    {}\n", row))
                .collect::<Vec<_>>()
                .join("");
            text.push_str(&format!("  Example rows:\n{}", examples));
        }

        text
    }

    fn format_column(table: &Table, column: &Column) -> String {
        let annotations = [
            table.primary_key.contains(&column.name).then_some("PK"),
            (!column.is_nullable).then_some("NOT NULL"),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ");

        match (annotations.is_empty(), &column.default) {
            (false, Some(default)) => format!(
                "  - {}: {} ({}, DEFAULT {})\n",
                column.name, column.data_type, annotations, default
            ),
            (false, None) => format!(
                "  - {}: {} ({})\n",
                column.name, column.data_type, annotations
            ),
            (true, Some(default)) => format!(
                "  - {}: {} (DEFAULT {})\n",
                column.name, column.data_type, default
            ),
            (true, None) => format!("  - {}: {}\n", column.name, column.data_type),
        }
    }

    /// Computes the structural difference from `old` to `self`.
    pub fn diff_from(&self, old: &Schema) -> SchemaDiff {
        let old_names: BTreeSet<&str> = old.tables.iter().map(|t| t.name.as_str()).collect();
        let new_names: BTreeSet<&str> = self.tables.iter().map(|t| t.name.as_str()).collect();

        let added_tables = new_names
            .difference(&old_names)
            .map(|s| s.to_string())
            .collect();
        let removed_tables = old_names
            .difference(&new_names)
            .map(|s| s.to_string())
            .collect();

        let changed_tables = self
            .tables
            .iter()
            .filter_map(|table| {
                old.tables
                    .iter()
                    .find(|t| t.name == table.name)
                    .filter(|t| t.structural_hash() != table.structural_hash())
                    .map(|_| table.name.clone())
            })
            .collect();

        SchemaDiff {
            added_tables,
            removed_tables,
            changed_tables,
        }
    }

    /// Computes a hash of the schema structure for change detection.
    ///
    /// Example rows are excluded so data churn does not read as a schema
    /// change.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.tables.len().hash(&mut hasher);
        for table in &self.tables {
            table.structural_hash().hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Table names, in schema order.
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }
}

/// Represents a database table (or collection).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    /// Table name.
    pub name: String,

    /// Columns in the table.
    pub columns: Vec<Column>,

    /// Column names that form the primary key.
    pub primary_key: Vec<String>,

    /// A few sample rows for first-time LLM context.
    #[serde(default)]
    pub example_rows: Vec<serde_json::Value>,
}

impl Table {
    /// Creates a new table with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn structural_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.name.hash(&mut hasher);
        self.columns.len().hash(&mut hasher);
        for col in &self.columns {
            col.name.hash(&mut hasher);
            col.data_type.hash(&mut hasher);
            col.is_nullable.hash(&mut hasher);
            col.default.hash(&mut hasher);
        }
        self.primary_key.hash(&mut hasher);
        hasher.finish()
    }
}

/// Represents a column in a table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Data type (e.g. "integer", "varchar(255)").
    pub data_type: String,

    /// Whether the column allows NULL values.
    pub is_nullable: bool,

    /// Default value expression, if any.
    pub default: Option<String>,
}

impl Column {
    /// Creates a new column with the given name and data type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_nullable: true,
            default: None,
        }
    }

    /// Sets whether the column is nullable.
    pub fn nullable(self, nullable: bool) -> Self {
        Self {
            is_nullable: nullable,
            ..self
        }
    }

    /// Sets the default value.
    pub fn with_default(self, default: impl Into<String>) -> Self {
        Self {
            default: Some(default.into()),
            ..self
        }
    }
}

/// Opaque structural diff produced by an incremental refresh.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaDiff {
    pub added_tables: Vec<String>,
    pub removed_tables: Vec<String>,
    pub changed_tables: Vec<String>,
}

impl SchemaDiff {
    /// True when the refresh found no structural changes.
    pub fn is_empty(&self) -> bool {
        self.added_tables.is_empty()
            && self.removed_tables.is_empty()
            && self.changed_tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_schema() -> Schema {
        Schema {
            tables: vec![
                Table {
                    name: "users".to_string(),
                    columns: vec![
                        Column::new("id", "integer").nullable(false),
                        Column::new("email", "varchar(255)").nullable(false),
                        Column::new("name", "varchar(100)"),
                    ],
                    primary_key: vec!["id".to_string()],
                    example_rows: vec![json!({"id": 1, "email": "a@b.c", "name": "Alice"})],
                },
                Table {
                    name: "orders".to_string(),
                    columns: vec![
                        Column::new("id", "integer").nullable(false),
                        Column::new("user_id", "integer").nullable(false),
                        Column::new("total", "numeric(10,2)")
                            .nullable(false)
                            .with_default("0"),
                    ],
                    primary_key: vec!["id".to_string()],
                    example_rows: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_format_for_llm_with_examples() {
        let formatted = sample_schema().format_for_llm(true);

        assert!(formatted.contains("Table: users"));
        assert!(formatted.contains("Table: orders"));
        assert!(formatted.contains("id: integer (PK, NOT NULL)"));
        assert!(formatted.contains("total: numeric(10,2) (NOT NULL, DEFAULT 0)"));
        assert!(formatted.contains("Example rows:"));
        assert!(formatted.contains("\"email\":\"a@b.c\""));
    }

    #[test]
    fn test_format_for_llm_without_examples() {
        let formatted = sample_schema().format_for_llm(false);
        assert!(!formatted.contains("Example rows:"));
    }

    #[test]
    fn test_projection_keeps_named_tables() {
        let projected = sample_schema().project(&["orders".to_string()]);
        assert_eq!(projected.table_names(), vec!["orders"]);
    }

    #[test]
    fn test_projection_ignores_unknown_names() {
        let projected =
            sample_schema().project(&["orders".to_string(), "missing".to_string()]);
        assert_eq!(projected.table_names(), vec!["orders"]);
    }

    #[test]
    fn test_diff_detects_added_and_removed() {
        let old = sample_schema();
        let mut new = sample_schema();
        new.tables.remove(0);
        new.tables.push(Table::new("invoices"));

        let diff = new.diff_from(&old);
        assert_eq!(diff.added_tables, vec!["invoices"]);
        assert_eq!(diff.removed_tables, vec!["users"]);
        assert!(diff.changed_tables.is_empty());
    }

    #[test]
    fn test_diff_detects_column_change() {
        let old = sample_schema();
        let mut new = sample_schema();
        new.tables[0].columns.push(Column::new("age", "integer"));

        let diff = new.diff_from(&old);
        assert_eq!(diff.changed_tables, vec!["users"]);
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_content_hash_ignores_example_rows() {
        let a = sample_schema();
        let mut b = sample_schema();
        b.tables[0].example_rows = vec![json!({"id": 99})];
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_empty_diff() {
        let schema = sample_schema();
        assert!(schema.diff_from(&schema).is_empty());
    }
}
