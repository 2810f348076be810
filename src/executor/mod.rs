//! Driver-agnostic query execution (C4).

mod cancel;
mod query;

pub use cancel::CancelRegistry;
pub use query::{
    extract_total, ExecutionOutcome, QueryExecutor, INTERACTIVE_TIMEOUT, MAX_RESULT_ROWS,
};
