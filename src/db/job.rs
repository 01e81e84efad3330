//! Job ledger
//!
//! Every job the SLURM backend handles gets a row: inserted when its script is staged on disk,
//! updated with the scheduler id once `sbatch` accepts it, and marked terminal when a status poll
//! sees it finish.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;

use state::JobState;

pub mod load;
pub mod update;
pub mod state;

/// A row of the `job` table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRecord {
    pub id: i64,
    pub run_id: String,
    pub name: String,
    pub script_path: PathBuf,
    pub batch_id: Option<String>,
    pub state: JobState,
}

pub struct JobLedger {
    conn: Mutex<Connection>,
}

impl JobLedger {
    pub fn new(conn: Connection) -> JobLedger {
        JobLedger { conn: Mutex::new(conn) }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // statements are atomic, so a poisoned connection is still consistent
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
