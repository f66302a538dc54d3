//! HistoryStore - the evaluation history of an optimization campaign
//!
//! A single growable table of evaluation records addressed by row id. The
//! table is the shared ground truth for "what has been proposed" and "what
//! has returned":
//!
//! - **Append-only**: rows are never deleted, ids are never reused
//! - **Single write per row**: a result may be written back exactly once
//! - **Columnar arena**: fixed-width rows stored in flat vectors with
//!   amortized growth, so appends never copy the whole table
//!
//! # Modules
//!
//! - [`record`] - row types, evaluation values and row status
//! - [`store`] - the in-memory arena and its operations
//! - [`table`] - persistence as a positional CSV table or JSON Lines

pub mod error;
pub mod record;
pub mod store;
pub mod table;

pub use error::{HistoryError, Result};
pub use record::{EvalStatus, Evaluation, HistoryRecord, NewRow, ObjectiveShape, Returned};
pub use store::{HistoryStore, HistorySummary, RecordView};

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
