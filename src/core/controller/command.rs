use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{BoardRun, ControllerState, TestCase, TestController};

/// Runs the test controller as a child process per board:
/// `<program> <args..> --board <board> --commit <sha>`.
///
/// If the process prints a JSON report on stdout it is used as is;
/// otherwise the exit status decides pass/fail and stdout becomes the log.
pub struct CommandController {
    program: PathBuf,
    args: Vec<String>,
}

#[derive(Deserialize)]
struct ControllerReport {
    state: String,
    result: bool,
    #[serde(default)]
    log: String,
    #[serde(default)]
    tests: Vec<TestCase>,
}

impl CommandController {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

#[async_trait]
impl TestController for CommandController {
    async fn run(&self, board: &str, commit_sha: &str) -> Result<BoardRun> {
        debug!(program = %self.program.display(), board, commit_sha, "Spawning test controller");

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("--board")
            .arg(board)
            .arg("--commit")
            .arg(commit_sha)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run test controller {}", self.program.display()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        Ok(parse_run(board, output.status.code(), stdout, stderr))
    }
}

fn parse_run(board: &str, exit_status: Option<i32>, stdout: String, stderr: String) -> BoardRun {
    match serde_json::from_str::<ControllerReport>(stdout.trim()) {
        Ok(report) => BoardRun {
            board: board.to_string(),
            state: ControllerState::parse(&report.state),
            passed: report.result,
            log: report.log,
            stderr,
            exit_status,
            tests: report.tests,
        },
        Err(_) => BoardRun {
            board: board.to_string(),
            state: ControllerState::Ready,
            passed: exit_status == Some(0),
            log: stdout,
            stderr,
            exit_status,
            tests: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::report::BoardOutcome;

    #[test]
    fn json_report_is_preferred() {
        let stdout = r#"{"state":"error","result":false,"log":"could not open /dev/ttyACM0"}"#;
        let run = parse_run("metro_m4_express", Some(0), stdout.to_string(), String::new());
        assert_eq!(run.state, ControllerState::Error);
        assert_eq!(run.log, "could not open /dev/ttyACM0");
        assert!(matches!(run.outcome(), BoardOutcome::Error(_)));
    }

    #[test]
    fn plain_output_falls_back_to_exit_status() {
        let run = parse_run("metro_m4_express", Some(1), "boom".to_string(), "trace".to_string());
        assert_eq!(run.state, ControllerState::Ready);
        assert!(!run.passed);
        assert_eq!(run.log, "boom");
        assert_eq!(run.stderr, "trace");

        let run = parse_run("metro_m4_express", Some(0), "fine".to_string(), String::new());
        assert!(run.passed);

        let run = parse_run("metro_m4_express", None, String::new(), String::new());
        assert!(!run.passed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_child_process_with_board_and_commit() {
        // sh -c <script> <$0> --board <$2> --commit <$4>
        let controller = CommandController::new(
            PathBuf::from("sh"),
            vec![
                "-c".to_string(),
                r#"printf '{"state":"ready","result":true,"log":"%s@%s","tests":[{"name":"digitalio","passed":true}]}' "$2" "$4""#
                    .to_string(),
                "controller".to_string(),
            ],
        );

        let run = controller.run("metro_m4_express", "abc123").await.unwrap();
        assert_eq!(run.log, "metro_m4_express@abc123");
        assert_eq!(run.exit_status, Some(0));
        assert_eq!(run.tests.len(), 1);
        assert_eq!(run.outcome(), BoardOutcome::Passed);
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let controller =
            CommandController::new(PathBuf::from("/nonexistent/rosie-test-controller"), Vec::new());
        assert!(controller.run("metro_m4_express", "abc123").await.is_err());
    }
}
