//! Node agent: pulls jobs off the shared queue and runs them on this node's
//! boards, one job at a time.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::core::controller::TestController;
use crate::core::delivery::{Delivery, ReportSink};
use crate::core::models::{Job, JobResult, NodeStatus, Operation, RunTestsArgs};
use crate::core::node::node_status;
use crate::core::queue::{JobQueue, QueueError};
use crate::core::report::{BoardOutcome, BoardReport, Conclusion, Outcome, ReportAssembler};
use crate::logging::LogThrottle;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Job {job_id} requests unknown operation {operation:?}")]
    UnknownOperation { job_id: String, operation: String },

    #[error("Job {job_id} has invalid arguments: {reason}")]
    InvalidArgs { job_id: String, reason: String },
}

/// Runs one commit against every board attached to the node.
#[derive(Clone)]
pub struct BoardRunner {
    boards: Vec<String>,
    controller: Arc<dyn TestController>,
    assembler: ReportAssembler,
}

impl BoardRunner {
    pub fn new(
        boards: Vec<String>,
        controller: Arc<dyn TestController>,
        assembler: ReportAssembler,
    ) -> Self {
        Self {
            boards,
            controller,
            assembler,
        }
    }

    /// Test `commit_sha` on each board in turn.
    ///
    /// Never fails: a board whose controller invocation errors is reported
    /// as `BoardOutcome::Error` and the error text lands in `exception`.
    pub async fn run_tests(&self, commit_sha: &str) -> JobResult {
        let mut boards = Vec::with_capacity(self.boards.len());
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exceptions = Vec::new();

        for board in &self.boards {
            info!(board = %board, commit_sha, "Testing board");

            match self.controller.run(board, commit_sha).await {
                Ok(run) => {
                    append_stream(&mut stdout, board, &run.log);
                    append_stream(&mut stderr, board, &run.stderr);

                    let report = run.to_report();
                    info!(board = %board, outcome = report.outcome.label(), "Board finished");
                    boards.push(report);
                }
                Err(e) => {
                    let description = format!("{e:#}");
                    warn!(board = %board, error = %description, "Test controller failed");
                    exceptions.push(format!("{board}: {description}"));
                    boards.push(BoardReport::new(
                        board,
                        BoardOutcome::Error(description),
                        Vec::new(),
                        "",
                    ));
                }
            }
        }

        let outcome = self.assembler.assemble(commit_sha, boards);
        JobResult {
            exit_status: if outcome.conclusion == Conclusion::Success { 0 } else { 1 },
            stdout,
            stderr,
            exception: (!exceptions.is_empty()).then(|| exceptions.join("\n")),
            outcome: Some(outcome),
        }
    }
}

fn append_stream(stream: &mut String, board: &str, text: &str) {
    if text.is_empty() {
        return;
    }
    stream.push_str(&format!("[{board}]\n{text}"));
    if !text.ends_with('\n') {
        stream.push('\n');
    }
}

/// A job that has run but whose result is not yet in the store.
struct Finished {
    job_id: String,
    result: JobResult,
}

enum Claimed {
    Job(Job),
    /// Claimed, but the stored row cannot be decoded. It still has to be
    /// closed out or the node stays busy.
    Unreadable(Finished),
}

pub struct NodeAgent {
    ctx: AppContext,
    runner: BoardRunner,
    sink: Option<Arc<dyn ReportSink>>,
}

impl NodeAgent {
    pub fn new(
        ctx: AppContext,
        controller: Arc<dyn TestController>,
        sink: Option<Arc<dyn ReportSink>>,
    ) -> Self {
        let runner = BoardRunner::new(
            ctx.config.boards.clone(),
            controller,
            ReportAssembler::new(ctx.config.commit_url_base.clone()),
        );
        Self { ctx, runner, sink }
    }

    pub fn node_name(&self) -> &str {
        self.ctx.config.node_name()
    }

    pub async fn status(&self) -> NodeStatus {
        node_status(&self.ctx.queue, self.node_name()).await
    }

    /// Execute a claimed job.
    ///
    /// Test failures come back inside the `JobResult`; only a job this
    /// agent cannot interpret is an error.
    pub async fn run(&self, job: &Job) -> Result<JobResult, AgentError> {
        let operation = job.operation().ok_or_else(|| AgentError::UnknownOperation {
            job_id: job.id.clone(),
            operation: job.operation.clone(),
        })?;

        match operation {
            Operation::RunTests => {
                let args: RunTestsArgs =
                    serde_json::from_value(job.args.clone()).map_err(|e| {
                        AgentError::InvalidArgs {
                            job_id: job.id.clone(),
                            reason: e.to_string(),
                        }
                    })?;

                if args.commit_sha.trim().is_empty() {
                    return Err(AgentError::InvalidArgs {
                        job_id: job.id.clone(),
                        reason: "commit_sha is empty".to_string(),
                    });
                }

                Ok(self.runner.run_tests(&args.commit_sha).await)
            }
        }
    }

    /// Claim, run, report, and record a single job.
    ///
    /// Returns `Ok(None)` when the queue was empty.
    pub async fn process_next(&self) -> Result<Option<JobResult>, AgentError> {
        let Some(claimed) = self.claim().await? else {
            return Ok(None);
        };

        let finished = self.settle(claimed).await;
        self.record(&finished).await?;
        Ok(Some(finished.result))
    }

    /// Work the queue until `shutdown` fires. A running job is always
    /// finished before the loop exits.
    ///
    /// When the store goes away the agent keeps the unrecorded result (if
    /// any), backs off, and reconnects; it does not claim again until that
    /// result is stored.
    pub async fn start(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let agent_config = self.ctx.config.agent.clone();
        info!(
            node = self.node_name(),
            queue = self.ctx.queue.name(),
            boards = ?self.ctx.config.boards,
            "Node agent starting"
        );
        if self.ctx.config.boards.is_empty() {
            warn!("No boards configured, every job will report success without testing");
        }

        let idle_log = LogThrottle::new(Duration::from_secs(60));
        let outage_log = LogThrottle::new(Duration::from_secs(30));
        let mut backoff = agent_config.reconnect_backoff();
        let mut pending: Option<Finished> = None;

        // A result in hand is recorded even when shutdown has been requested.
        while !shutdown.is_cancelled() || pending.is_some() {
            let step = match pending.take() {
                Some(finished) => match self.record(&finished).await {
                    Ok(()) => Ok(()),
                    Err(e @ AgentError::Queue(QueueError::Unavailable(_))) => {
                        pending = Some(finished);
                        Err(e)
                    }
                    Err(e) => {
                        error!(job_id = %finished.job_id, error = %e, "Job result could not be recorded");
                        Ok(())
                    }
                },
                None => match self.claim().await {
                    Ok(Some(claimed)) => {
                        pending = Some(self.settle(claimed).await);
                        idle_log.reset();
                        Ok(())
                    }
                    Ok(None) => {
                        if idle_log.should_log() {
                            debug!("Queue empty, waiting for jobs");
                        }
                        if !pause(&shutdown, agent_config.poll_interval()).await {
                            break;
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
            };

            match step {
                Ok(()) => {
                    backoff = agent_config.reconnect_backoff();
                    outage_log.reset();
                }
                Err(AgentError::Queue(QueueError::Unavailable(reason))) => {
                    if outage_log.should_log() {
                        warn!(error = %reason, retry_in = ?backoff, "Job queue unavailable, reconnecting");
                    }
                    if !pause(&shutdown, backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(agent_config.max_backoff());
                    self.reconnect().await;
                }
                Err(e) => {
                    error!(error = %e, "Job queue operation failed");
                }
            }
        }

        if let Some(finished) = pending {
            error!(
                job_id = %finished.job_id,
                "Shutting down with an unrecorded job result"
            );
        }
        info!("Node agent stopped");
        Ok(())
    }

    async fn claim(&self) -> Result<Option<Claimed>, AgentError> {
        match self.ctx.queue.claim_next().await {
            Ok(job) => Ok(job.map(Claimed::Job)),
            Err(QueueError::Corrupt { job_id, reason }) => {
                error!(job_id = %job_id, reason = %reason, "Claimed job has an unreadable record");
                let result = JobResult::from_error(format!("Unreadable job record: {reason}"));
                Ok(Some(Claimed::Unreadable(Finished { job_id, result })))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn settle(&self, claimed: Claimed) -> Finished {
        match claimed {
            Claimed::Job(job) => self.execute(&job).await,
            Claimed::Unreadable(finished) => finished,
        }
    }

    async fn execute(&self, job: &Job) -> Finished {
        let started = std::time::Instant::now();
        info!(job_id = %job.id, commit_sha = job.commit_sha().unwrap_or(""), "Running job");

        let result = match self.run(job).await {
            Ok(result) => {
                if let Some(outcome) = &result.outcome {
                    self.deliver(job, outcome).await;
                }
                result
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Job cannot be executed");
                JobResult::from_error(e.to_string())
            }
        };

        info!(
            job_id = %job.id,
            exit_status = result.exit_status,
            duration_secs = started.elapsed().as_secs(),
            "Job finished"
        );

        Finished {
            job_id: job.id.clone(),
            result,
        }
    }

    async fn deliver(&self, job: &Job, outcome: &Outcome) {
        let delivery = Delivery {
            job_id: &job.id,
            commit_sha: job.commit_sha().unwrap_or(""),
            node: self.node_name(),
            outcome,
        };

        let Some(sink) = &self.sink else {
            match serde_json::to_string(&delivery) {
                Ok(payload) => info!(job_id = %job.id, report = %payload, "Report ready (no delivery sink configured)"),
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to encode report"),
            }
            return;
        };

        if let Err(e) = sink.deliver(&delivery).await {
            warn!(job_id = %job.id, error = %format!("{e:#}"), "Report delivery failed");
        }
    }

    async fn record(&self, finished: &Finished) -> Result<(), AgentError> {
        if finished.result.exception.is_some() {
            self.ctx.queue.fail(&finished.job_id, &finished.result).await?;
        } else {
            self.ctx.queue.complete(&finished.job_id, &finished.result).await?;
        }

        if let Err(e) = self.ctx.queue.purge_expired().await {
            debug!(error = %e, "Skipping purge of expired jobs");
        }
        Ok(())
    }

    async fn reconnect(&mut self) {
        match JobQueue::connect(&self.ctx.config.queue, self.node_name().to_string()).await {
            Ok(queue) => {
                info!(queue = queue.name(), "Reconnected to job queue");
                self.ctx.queue = queue;
            }
            Err(e) => debug!(error = %e, "Reconnect attempt failed"),
        }
    }
}

/// Sleep for `duration` unless shutdown comes first. Returns false on shutdown.
async fn pause(shutdown: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::controller::{SimulatedBoard, SimulatedController};

    fn runner(controller: SimulatedController) -> BoardRunner {
        BoardRunner::new(
            vec!["metro_m4_express".to_string(), "feather_nrf52840".to_string()],
            Arc::new(controller.with_test_duration(Duration::ZERO)),
            ReportAssembler::new("https://example.invalid/commit/"),
        )
    }

    #[tokio::test]
    async fn all_boards_passing_is_success() {
        let result = runner(SimulatedController::new()).run_tests("abc123").await;
        let outcome = result.outcome.expect("outcome");

        assert_eq!(result.exit_status, 0);
        assert!(result.exception.is_none());
        assert_eq!(outcome.conclusion, Conclusion::Success);
        assert_eq!(outcome.boards.len(), 2);
        assert!(result.stdout.contains("[metro_m4_express]"));
        assert!(result.stdout.contains("[feather_nrf52840]"));
    }

    #[tokio::test]
    async fn one_failing_board_fails_the_job_result() {
        let controller =
            SimulatedController::new().with_board("feather_nrf52840", SimulatedBoard::Fail);
        let result = runner(controller).run_tests("abc123").await;
        let outcome = result.outcome.expect("outcome");

        assert_eq!(result.exit_status, 1);
        assert!(result.exception.is_none());
        assert_eq!(outcome.conclusion, Conclusion::Failure);
        assert_eq!(outcome.boards[0].outcome, BoardOutcome::Passed);
        assert!(matches!(outcome.boards[1].outcome, BoardOutcome::Failed(_)));
    }

    #[test]
    fn append_stream_labels_boards() {
        let mut out = String::new();
        append_stream(&mut out, "metro_m4_express", "ok");
        append_stream(&mut out, "feather_nrf52840", "");
        assert_eq!(out, "[metro_m4_express]\nok\n");
    }
}
