use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_rusqlite::{Connection, rusqlite};

pub mod jobs;

/// Open the shared queue database and make sure the schema exists.
///
/// Each process opens its own connection to the same file. WAL lets status
/// reads proceed while another process holds the write lock, and the busy
/// timeout covers contention between claiming agents.
pub async fn open(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path.to_path_buf())
        .await
        .with_context(|| format!("Failed to open queue database {}", path.display()))?;

    conn.call(move |c| {
        c.busy_timeout(busy_timeout)?;
        let _mode: String =
            c.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

        let schema = include_str!("schema.sql");
        c.execute_batch(schema)?;

        Ok::<(), rusqlite::Error>(())
    })
    .await
    .with_context(|| format!("Failed to initialise queue database {}", path.display()))?;

    Ok(conn)
}
