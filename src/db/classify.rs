//! SQL statement classification.
//!
//! Uses sqlparser with the PostgreSQL dialect to decide whether a query
//! fetches or mutates. The orchestrator never auto-executes a mutating
//! statement regardless of what the LLM plan claims, and the executor
//! refuses to run a mutating count probe.

use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Coarse classification of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Read-only fetch (SELECT, SHOW, plain EXPLAIN).
    Fetch,
    /// Data modification (INSERT, UPDATE, DELETE, MERGE).
    Mutation,
    /// Schema change (CREATE, ALTER, DROP, TRUNCATE).
    Ddl,
    /// Could not be parsed; treated as mutating.
    Unknown,
}

impl QueryKind {
    /// True for statements that may change state.
    pub fn is_critical(&self) -> bool {
        !matches!(self, Self::Fetch)
    }
}

/// Classifies a SQL string.
///
/// Unparseable input is classified `Unknown`, which is treated as critical
/// (conservative default). Multi-statement input takes the most dangerous
/// classification.
pub fn classify_query(sql: &str) -> QueryKind {
    let dialect = PostgreSqlDialect {};
    let statements = match Parser::parse_sql(&dialect, sql) {
        Ok(statements) if !statements.is_empty() => statements,
        _ => return QueryKind::Unknown,
    };

    statements
        .iter()
        .map(classify_statement)
        .max_by_key(|kind| priority(kind))
        .unwrap_or(QueryKind::Unknown)
}

fn priority(kind: &QueryKind) -> u8 {
    match kind {
        QueryKind::Fetch => 0,
        QueryKind::Mutation => 1,
        QueryKind::Ddl => 2,
        QueryKind::Unknown => 3,
    }
}

fn classify_statement(statement: &Statement) -> QueryKind {
    match statement {
        Statement::Query(_) => QueryKind::Fetch,
        Statement::Explain { analyze, statement, .. } => {
            if *analyze {
                classify_statement(statement)
            } else {
                QueryKind::Fetch
            }
        }
        Statement::ShowVariable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. } => QueryKind::Fetch,

        Statement::Insert(_) | Statement::Update { .. } | Statement::Merge { .. } => {
            QueryKind::Mutation
        }
        Statement::Delete(_) => QueryKind::Mutation,

        Statement::CreateTable { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateView { .. }
        | Statement::AlterTable { .. }
        | Statement::Drop { .. }
        | Statement::Truncate { .. } => QueryKind::Ddl,

        _ => QueryKind::Unknown,
    }
}
