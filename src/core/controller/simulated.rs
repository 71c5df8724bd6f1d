use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::sleep;

use super::{BoardRun, ControllerState, TestCase, TestController};

const SIMULATED_TESTS: [&str; 3] = ["digitalio", "analogio", "busio"];

/// How a simulated board behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimulatedBoard {
    #[default]
    Pass,
    /// `analogio` fails.
    Fail,
    /// The board never answers.
    Disconnected,
}

/// Controller stand-in that scripts board behaviour instead of touching
/// hardware. Unlisted boards pass.
pub struct SimulatedController {
    boards: HashMap<String, SimulatedBoard>,
    test_duration: Duration,
}

impl Default for SimulatedController {
    fn default() -> Self {
        Self {
            boards: HashMap::new(),
            test_duration: Duration::from_millis(500),
        }
    }
}

impl SimulatedController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_board(mut self, board: impl Into<String>, behaviour: SimulatedBoard) -> Self {
        self.boards.insert(board.into(), behaviour);
        self
    }

    /// Time spent "running" each test.
    pub fn with_test_duration(mut self, duration: Duration) -> Self {
        self.test_duration = duration;
        self
    }
}

#[async_trait]
impl TestController for SimulatedController {
    async fn run(&self, board: &str, commit_sha: &str) -> Result<BoardRun> {
        let behaviour = self.boards.get(board).copied().unwrap_or_default();
        let banner = "=".repeat(40);
        let rule = "-".repeat(60);

        let mut log = format!("{banner}\nrosie simulated run: {board} @ {commit_sha}\n{banner}\n");

        if behaviour == SimulatedBoard::Disconnected {
            log.push_str(&format!("Could not connect to {board}\n"));
            return Ok(BoardRun {
                board: board.to_string(),
                state: ControllerState::Error,
                passed: false,
                log,
                stderr: String::new(),
                exit_status: Some(2),
                tests: Vec::new(),
            });
        }

        let mut tests = Vec::with_capacity(SIMULATED_TESTS.len());
        for name in SIMULATED_TESTS {
            sleep(self.test_duration).await;

            let passed = !(behaviour == SimulatedBoard::Fail && name == "analogio");
            let verdict = if passed { "ok" } else { "FAIL" };
            log.push_str(&format!("Starting test: {name}\n{name} ... {verdict}\n{rule}\n{banner}\n"));
            tests.push(TestCase {
                name: name.to_string(),
                passed,
            });
        }

        let passed = tests.iter().all(|t| t.passed);
        Ok(BoardRun {
            board: board.to_string(),
            state: ControllerState::Ready,
            passed,
            log,
            stderr: String::new(),
            exit_status: Some(if passed { 0 } else { 1 }),
            tests,
        })
    }
}
