//! Dispatched batch jobs are recorded in a SQLite database

/// Connect to a SQLite database
pub mod open;
/// Stage, submit and finish jobs in the ledger
pub mod job;

pub use job::{JobLedger, JobRecord};
pub use job::state::JobState;
pub use open::open_db;
