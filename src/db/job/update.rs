use std::path::Path;

use chrono::Utc;
use log::info;
use rusqlite::params;

use crate::db::job::state::JobState;
use crate::db::job::JobLedger;

impl JobLedger {
    /// Record a job whose script was written to `script_path`, returning its ledger id
    pub fn stage(&self, run_id: &str, name: &str, script_path: &Path) -> rusqlite::Result<i64> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO job (run_id, name, script_path, state, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![run_id, name, script_path.to_string_lossy().into_owned(), JobState::Staged.as_str(), now],
        )?;
        let id = conn.last_insert_rowid();
        info!("Staged job {id} for run {run_id}");
        Ok(id)
    }

    pub fn submit(&self, id: i64, batch_id: &str) -> rusqlite::Result<()> {
        info!("Updating job {id} with SLURM id {batch_id}");
        self.lock().execute(
            "UPDATE job SET batch_id = ?1, state = ?2, updated_at = ?3 WHERE id = ?4",
            params![batch_id, JobState::Submitted.as_str(), Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Mark the job with scheduler id `batch_id` as terminal, returns false for unknown jobs
    pub fn finish(&self, batch_id: &str, state: JobState) -> rusqlite::Result<bool> {
        let updated = self.lock().execute(
            "UPDATE job SET state = ?1, updated_at = ?2 WHERE batch_id = ?3 AND state != ?1",
            params![state.as_str(), Utc::now().to_rfc3339(), batch_id],
        )?;
        if updated > 0 {
            info!("SLURM job {batch_id} is {state}");
        }
        Ok(updated > 0)
    }
}
