//! Durable job queue shared by the dispatch API and the node agents.
//!
//! A `JobQueue` is one process's handle onto a named queue in the shared
//! SQLite store. Handles are cheap to clone; separate processes each open
//! their own. All coordination between processes goes through the store.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_rusqlite::Connection;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::core::models::{Job, JobHandle, JobResult, JobState, Operation};
use crate::db::{self, jobs::JobRow, jobs::NewJob};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue store unavailable: {0}")]
    Unavailable(String),

    #[error("Job {job_id} has an unreadable record: {reason}")]
    Corrupt { job_id: String, reason: String },

    #[error("Job {job_id} cannot move to {to}: it is not running")]
    InvalidTransition { job_id: String, to: &'static str },

    #[error("Failed to encode job data: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<anyhow::Error> for QueueError {
    fn from(e: anyhow::Error) -> Self {
        QueueError::Unavailable(format!("{e:#}"))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Clone)]
pub struct JobQueue {
    conn: Connection,
    name: String,
    /// Node identity recorded on claimed jobs.
    worker: String,
    result_ttl: Option<Duration>,
}

impl JobQueue {
    /// Open a handle on `config.name`. Failing to reach the store is a hard
    /// error here, not on first use.
    pub async fn connect(config: &QueueConfig, worker: impl Into<String>) -> Result<Self> {
        let conn = db::open(&config.path, config.busy_timeout()).await?;
        let queue = Self {
            conn,
            name: config.name.clone(),
            worker: worker.into(),
            result_ttl: config.result_ttl(),
        };

        debug!(queue = %queue.name, path = %config.path.display(), "Connected to job queue");
        Ok(queue)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Append a queued job. Concurrent enqueues are ordered as the store
    /// commits them.
    pub async fn enqueue<A: Serialize>(&self, operation: Operation, args: &A) -> Result<JobHandle> {
        let id = Uuid::now_v7().to_string();
        let job = NewJob {
            id: id.clone(),
            queue: self.name.clone(),
            operation: operation.as_str().to_string(),
            args: serde_json::to_string(args)?,
            enqueued_at: timestamp(Utc::now()),
        };

        db::jobs::insert(&self.conn, job).await?;
        info!(job_id = %id, queue = %self.name, operation = operation.as_str(), "Job enqueued");

        Ok(JobHandle { id })
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        db::jobs::get(&self.conn, job_id.to_string())
            .await?
            .map(decode_row)
            .transpose()
    }

    /// Jobs this node is currently running. The busy signal for the node.
    pub async fn count_running(&self) -> Result<usize> {
        let count = db::jobs::count(
            &self.conn,
            self.name.clone(),
            JobState::Running.as_str(),
            Some(self.worker.clone()),
        )
        .await?;
        Ok(count)
    }

    /// Jobs waiting to be claimed by any node.
    pub async fn count_queued(&self) -> Result<usize> {
        let count =
            db::jobs::count(&self.conn, self.name.clone(), JobState::Queued.as_str(), None).await?;
        Ok(count)
    }

    /// Atomically claim the oldest queued job for this node.
    ///
    /// Returns `None` when nothing is queued. A job is never handed to more
    /// than one claimer, whichever process they run in.
    pub async fn claim_next(&self) -> Result<Option<Job>> {
        let row = db::jobs::claim_oldest(
            &self.conn,
            self.name.clone(),
            self.worker.clone(),
            timestamp(Utc::now()),
        )
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let job = decode_row(row)?;
        info!(job_id = %job.id, worker = %self.worker, "Job claimed");
        Ok(Some(job))
    }

    /// running -> finished.
    pub async fn complete(&self, job_id: &str, result: &JobResult) -> Result<()> {
        self.finish(job_id, JobState::Finished, result).await
    }

    /// running -> failed. `result.exception` should say why.
    pub async fn fail(&self, job_id: &str, result: &JobResult) -> Result<()> {
        self.finish(job_id, JobState::Failed, result).await
    }

    async fn finish(&self, job_id: &str, state: JobState, result: &JobResult) -> Result<()> {
        let encoded = serde_json::to_string(result)?;
        let updated = db::jobs::finish(
            &self.conn,
            job_id.to_string(),
            state.as_str(),
            encoded,
            timestamp(Utc::now()),
        )
        .await?;

        if !updated {
            return Err(QueueError::InvalidTransition {
                job_id: job_id.to_string(),
                to: state.as_str(),
            });
        }

        info!(job_id, state = state.as_str(), "Job completed");
        Ok(())
    }

    /// Drop terminal jobs older than the configured retention. Without a
    /// retention setting nothing is ever removed.
    pub async fn purge_expired(&self) -> Result<usize> {
        let Some(ttl) = self.result_ttl else {
            return Ok(0);
        };

        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let deleted =
            db::jobs::purge_completed_before(&self.conn, self.name.clone(), timestamp(cutoff))
                .await?;
        if deleted > 0 {
            debug!(queue = %self.name, deleted, "Purged expired jobs");
        }
        Ok(deleted)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_row(row: JobRow) -> Result<Job> {
    let corrupt = |reason: String| QueueError::Corrupt {
        job_id: row.id.clone(),
        reason,
    };

    let state = JobState::from_str(&row.state)
        .ok_or_else(|| corrupt(format!("unknown state {:?}", row.state)))?;
    let args = serde_json::from_str(&row.args).map_err(|e| corrupt(format!("args: {e}")))?;
    let result = row
        .result
        .as_deref()
        .map(serde_json::from_str::<JobResult>)
        .transpose()
        .map_err(|e| corrupt(format!("result: {e}")))?;

    let parse_time = |raw: &str| {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| corrupt(format!("timestamp {raw:?}: {e}")))
    };
    let enqueued_at = parse_time(&row.enqueued_at)?;
    let started_at = row.started_at.as_deref().map(parse_time).transpose()?;
    let completed_at = row.completed_at.as_deref().map(parse_time).transpose()?;

    Ok(Job {
        id: row.id,
        queue: row.queue,
        operation: row.operation,
        args,
        state,
        worker: row.worker,
        result,
        enqueued_at,
        started_at,
        completed_at,
    })
}
