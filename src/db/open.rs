use std::path::Path;

use log::info;
use rusqlite::Connection;

pub fn open_db(dir: &Path) -> rusqlite::Result<Connection> {
    let path = dir.join("analysis-runner.db");
    if !path.exists() { info!("Creating new database {}", path.display()) }
    let conn = Connection::open(&path)?;

    static SCHEMA: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/db/schema.sql"));
    conn.execute_batch(SCHEMA)?;

    Ok(conn)
}
