pub mod sqlite;

pub use sqlite::{open_db, ExecutionSummaryRow};
