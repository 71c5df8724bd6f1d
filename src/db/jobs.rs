use anyhow::Result;
use tokio_rusqlite::rusqlite::{OptionalExtension, Row, TransactionBehavior};
use tokio_rusqlite::{Connection, params, rusqlite};

/// A `jobs` row as stored. Decoding into `core::Job` happens in the queue.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub queue: String,
    pub operation: String,
    pub args: String,
    pub state: String,
    pub worker: Option<String>,
    pub result: Option<String>,
    pub enqueued_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub queue: String,
    pub operation: String,
    pub args: String,
    pub enqueued_at: String,
}

const JOB_COLUMNS: &str = "id, queue, operation, args, state, worker, result, \
                           enqueued_at, started_at, completed_at";

fn map_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        queue: row.get(1)?,
        operation: row.get(2)?,
        args: row.get(3)?,
        state: row.get(4)?,
        worker: row.get(5)?,
        result: row.get(6)?,
        enqueued_at: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

pub async fn insert(conn: &Connection, job: NewJob) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "INSERT INTO jobs (id, queue, operation, args, state, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, 'queued', ?5)",
            params![job.id, job.queue, job.operation, job.args, job.enqueued_at],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn get(conn: &Connection, job_id: String) -> Result<Option<JobRow>> {
    let row = conn
        .call(move |c| {
            c.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id],
                map_row,
            )
            .optional()
        })
        .await?;

    Ok(row)
}

/// Move the oldest queued job of `queue` to running, owned by `worker`.
///
/// The IMMEDIATE transaction takes the database write lock before reading,
/// so concurrent claimers in any process serialize here and a job can be
/// handed out at most once.
pub async fn claim_oldest(
    conn: &Connection,
    queue: String,
    worker: String,
    started_at: String,
) -> Result<Option<JobRow>> {
    let claimed = conn
        .call(move |c| -> rusqlite::Result<Option<JobRow>> {
            let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let candidate = tx
                .query_row(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs
                         WHERE queue = ?1 AND state = 'queued'
                         ORDER BY seq ASC
                         LIMIT 1"
                    ),
                    params![queue],
                    map_row,
                )
                .optional()?;

            let Some(mut row) = candidate else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE jobs SET state = 'running', worker = ?2, started_at = ?3
                 WHERE id = ?1 AND state = 'queued'",
                params![row.id, worker, started_at],
            )?;
            tx.commit()?;

            row.state = "running".to_string();
            row.worker = Some(worker);
            row.started_at = Some(started_at);
            Ok(Some(row))
        })
        .await?;

    Ok(claimed)
}

/// Count jobs of `queue` in `state`, optionally only those owned by `worker`.
pub async fn count(
    conn: &Connection,
    queue: String,
    state: &'static str,
    worker: Option<String>,
) -> Result<usize> {
    let count = conn
        .call(move |c| {
            c.query_row(
                "SELECT COUNT(*) FROM jobs
                 WHERE queue = ?1 AND state = ?2 AND (?3 IS NULL OR worker = ?3)",
                params![queue, state, worker],
                |row| row.get::<_, i64>(0),
            )
        })
        .await?;

    Ok(count.max(0) as usize)
}

/// Record the terminal state of a running job.
///
/// Returns false when the job was not running, leaving the row untouched.
pub async fn finish(
    conn: &Connection,
    job_id: String,
    state: &'static str,
    result: String,
    completed_at: String,
) -> Result<bool> {
    let updated = conn
        .call(move |c| {
            c.execute(
                "UPDATE jobs SET state = ?2, result = ?3, completed_at = ?4
                 WHERE id = ?1 AND state = 'running'",
                params![job_id, state, result, completed_at],
            )
        })
        .await?;

    Ok(updated == 1)
}

/// Delete finished and failed jobs of `queue` completed before `cutoff`.
pub async fn purge_completed_before(
    conn: &Connection,
    queue: String,
    cutoff: String,
) -> Result<usize> {
    let deleted = conn
        .call(move |c| {
            c.execute(
                "DELETE FROM jobs
                 WHERE queue = ?1
                   AND state IN ('finished', 'failed')
                   AND completed_at < ?2",
                params![queue, cutoff],
            )
        })
        .await?;

    Ok(deleted)
}
