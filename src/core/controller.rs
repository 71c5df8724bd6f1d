//! Seam to the external test controller that drives the physical boards.
//!
//! The controller is opaque to rosie: it is handed a board and a commit,
//! blocks until the board has been flashed and tested, and reports back
//! what happened. A board that could not be reached is reported with
//! `ControllerState::Error`, which is distinct from tests that ran and
//! failed.

mod command;
mod simulated;

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::core::report::{BoardOutcome, BoardReport};

pub use command::CommandController;
pub use simulated::{SimulatedBoard, SimulatedController};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Ready,
    /// Connection-level failure; the tests never ran.
    Error,
}

impl ControllerState {
    /// Controllers report free-form states; only "error" is significant.
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("error") {
            Self::Error
        } else {
            Self::Ready
        }
    }
}

/// Everything the controller reported for one board.
#[derive(Debug, Clone)]
pub struct BoardRun {
    pub board: String,
    pub state: ControllerState,
    /// Overall test result as reported by the controller.
    pub passed: bool,
    pub log: String,
    pub stderr: String,
    pub exit_status: Option<i32>,
    pub tests: Vec<TestCase>,
}

impl BoardRun {
    pub fn outcome(&self) -> BoardOutcome {
        if self.state == ControllerState::Error {
            let reason = self
                .log
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("test controller reported an error")
                .trim()
                .to_string();
            return BoardOutcome::Error(reason);
        }

        if self.passed {
            return BoardOutcome::Passed;
        }

        let failed = self.tests.iter().filter(|t| !t.passed).count();
        if failed > 0 {
            BoardOutcome::Failed(format!("{failed} of {} tests failed", self.tests.len()))
        } else {
            BoardOutcome::Failed("tests failed".to_string())
        }
    }

    pub fn to_report(&self) -> BoardReport {
        BoardReport::new(&self.board, self.outcome(), self.tests.clone(), &self.log)
    }
}

#[async_trait]
pub trait TestController: Send + Sync {
    /// Flash `commit_sha` onto `board` and run its tests. Blocks for as long
    /// as the hardware takes.
    ///
    /// `Err` means the controller itself could not be run; test failures
    /// and unreachable boards are reported through `BoardRun`.
    async fn run(&self, board: &str, commit_sha: &str) -> Result<BoardRun>;
}

/// Pick the controller implementation for this node.
pub fn create_controller(config: &AppConfig) -> Result<Arc<dyn TestController>> {
    if config.simulation {
        return Ok(Arc::new(SimulatedController::default()));
    }

    match &config.controller.program {
        Some(program) => Ok(Arc::new(CommandController::new(
            program.clone(),
            config.controller.args.clone(),
        ))),
        None => bail!("No test controller configured: set controller.program or enable simulation"),
    }
}
