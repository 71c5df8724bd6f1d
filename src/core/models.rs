use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::report::Outcome;

/// Lifecycle of a job. Transitions only move forward:
/// queued -> running -> finished | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Finished,
    Failed,
}

impl JobState {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Operations a node agent knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Run the test controller against every board for one commit.
    RunTests,
}

impl Operation {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "run_tests" => Some(Self::RunTests),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunTests => "run_tests",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTestsArgs {
    pub commit_sha: String,
}

/// Handle returned by `JobQueue::enqueue`, used to look the job up later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    /// Raw operation name; see `Job::operation`.
    pub operation: String,
    pub args: Value,
    pub state: JobState,
    /// Node that claimed the job.
    pub worker: Option<String>,
    /// Present once the job is finished or failed.
    pub result: Option<JobResult>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn operation(&self) -> Option<Operation> {
        Operation::from_str(&self.operation)
    }

    pub fn commit_sha(&self) -> Option<&str> {
        self.args.get("commit_sha").and_then(Value::as_str)
    }
}

/// What a job produced: process-style status, captured streams, and the
/// assembled report when one could be built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
    pub exception: Option<String>,
    pub outcome: Option<Outcome>,
}

impl JobResult {
    pub fn from_error(error: impl Into<String>) -> Self {
        Self {
            exit_status: 1,
            exception: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Advisory busy/idle view of a node, recomputed on every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_name: String,
    pub busy: bool,
    pub job_count: usize,
    /// False when the queue store could not be read and the counts are unknown.
    pub queue_reachable: bool,
}

impl NodeStatus {
    pub fn from_running(node_name: impl Into<String>, running: usize) -> Self {
        Self {
            node_name: node_name.into(),
            busy: running > 0,
            job_count: running,
            queue_reachable: true,
        }
    }

    pub fn unknown(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            busy: false,
            job_count: 0,
            queue_reachable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_state_names_round_trip() {
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::Finished,
            JobState::Failed,
        ] {
            assert_eq!(JobState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(JobState::from_str("started"), None);
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn busy_tracks_job_count() {
        assert!(!NodeStatus::from_running("node", 0).busy);
        assert!(NodeStatus::from_running("node", 2).busy);

        let unknown = NodeStatus::unknown("node");
        assert_eq!(unknown.busy, unknown.job_count > 0);
        assert!(!unknown.queue_reachable);
    }

    #[test]
    fn job_exposes_commit_and_operation() {
        let job = Job {
            id: "job-1".to_string(),
            queue: "rosiepi".to_string(),
            operation: "run_tests".to_string(),
            args: json!({ "commit_sha": "abc123" }),
            state: JobState::Queued,
            worker: None,
            result: None,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        assert_eq!(job.operation(), Some(Operation::RunTests));
        assert_eq!(job.commit_sha(), Some("abc123"));
    }

    #[test]
    fn status_serializes_expected_fields() {
        let value = serde_json::to_value(NodeStatus::from_running("node_1", 1)).unwrap();
        assert_eq!(value["node_name"], "node_1");
        assert_eq!(value["busy"], true);
        assert_eq!(value["job_count"], 1);
    }
}
