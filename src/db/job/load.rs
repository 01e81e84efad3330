use std::path::PathBuf;

use rusqlite::{params, OptionalExtension, Row};

use crate::db::job::{JobLedger, JobRecord};

const COLUMNS: &str = "id, run_id, name, script_path, batch_id, state";

impl JobLedger {
    pub fn get(&self, id: i64) -> rusqlite::Result<Option<JobRecord>> {
        self.lock()
            .query_row(&format!("SELECT {COLUMNS} FROM job WHERE id = ?1"), params![id], read_record)
            .optional()
    }

    pub fn get_by_batch_id(&self, batch_id: &str) -> rusqlite::Result<Option<JobRecord>> {
        self.lock()
            .query_row(&format!("SELECT {COLUMNS} FROM job WHERE batch_id = ?1"), params![batch_id], read_record)
            .optional()
    }

    /// Number of jobs already staged for a run
    pub fn count(&self, run_id: &str) -> rusqlite::Result<i64> {
        self.lock().query_row("SELECT count(*) FROM job WHERE run_id = ?1", params![run_id], |row| row.get(0))
    }
}

fn read_record(row: &Row) -> rusqlite::Result<JobRecord> {
    let state: String = row.get(5)?;
    let state = state.parse().map_err(|err: String| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, err.into())
    })?;
    Ok(JobRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        name: row.get(2)?,
        script_path: PathBuf::from(row.get::<_, String>(3)?),
        batch_id: row.get(4)?,
        state,
    })
}
