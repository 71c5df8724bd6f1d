//! Report assembly for completed test runs.
//!
//! Turns per-board controller results for one commit into the `Outcome`
//! handed to the delivery sink. Everything here is pure text and data
//! shaping; no I/O.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::controller::TestCase;

pub const REPORT_TITLE: &str = "RosiePi";

/// Lines with at least this many `=` are section banners.
const BANNER_MIN_EQUALS: usize = 25;
/// Lines with at least this many `-` are horizontal rules.
const RULE_MIN_DASHES: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conclusion {
    Success,
    Failure,
}

/// Result of testing one board. Failures carry their description as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "details", rename_all = "lowercase")]
pub enum BoardOutcome {
    Passed,
    /// Tests ran and at least one failed.
    Failed(String),
    /// The board could not be tested (connection error, controller crash).
    Error(String),
}

impl BoardOutcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Passed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Passed => "Passed",
            Self::Failed(_) => "Failed",
            Self::Error(_) => "Error",
        }
    }

    fn details(&self) -> Option<&str> {
        match self {
            Self::Passed => None,
            Self::Failed(details) | Self::Error(details) => Some(details),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardReport {
    pub board: String,
    pub outcome: BoardOutcome,
    pub tests: Vec<TestCase>,
    /// Log sections with banners and rules removed.
    pub log: Vec<Vec<String>>,
}

impl BoardReport {
    pub fn new(
        board: impl Into<String>,
        outcome: BoardOutcome,
        tests: Vec<TestCase>,
        raw_log: &str,
    ) -> Self {
        Self {
            board: board.into(),
            outcome,
            tests,
            log: excerpt(raw_log),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportOutput {
    pub title: String,
    pub summary: String,
    pub text: String,
}

/// The structured report handed to the delivery collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub conclusion: Conclusion,
    #[serde(with = "utc_seconds")]
    pub completed_at: DateTime<Utc>,
    pub output: ReportOutput,
    pub boards: Vec<BoardReport>,
}

/// Builds outcomes for a node's commits.
#[derive(Debug, Clone)]
pub struct ReportAssembler {
    commit_url_base: String,
}

impl ReportAssembler {
    pub fn new(commit_url_base: impl Into<String>) -> Self {
        Self {
            commit_url_base: commit_url_base.into(),
        }
    }

    pub fn assemble(&self, commit_sha: &str, boards: Vec<BoardReport>) -> Outcome {
        self.assemble_at(commit_sha, boards, Utc::now())
    }

    pub fn assemble_at(
        &self,
        commit_sha: &str,
        boards: Vec<BoardReport>,
        completed_at: DateTime<Utc>,
    ) -> Outcome {
        Outcome {
            conclusion: conclude(&boards),
            completed_at,
            output: ReportOutput {
                title: REPORT_TITLE.to_string(),
                summary: self.summary(commit_sha),
                text: render_boards(&boards),
            },
            boards,
        }
    }

    fn summary(&self, commit_sha: &str) -> String {
        let short: String = commit_sha.chars().take(5).collect();
        format!(
            "Tested commit [{short}]({base}{commit_sha}) with rosie {version}",
            base = self.commit_url_base,
            version = env!("CARGO_PKG_VERSION"),
        )
    }
}

/// `Failure` if any board failed or errored, `Success` otherwise.
pub fn conclude(boards: &[BoardReport]) -> Conclusion {
    if boards.iter().any(|b| b.outcome.is_failure()) {
        Conclusion::Failure
    } else {
        Conclusion::Success
    }
}

pub fn is_separator(line: &str) -> bool {
    is_banner(line) || line.matches('-').count() >= RULE_MIN_DASHES
}

fn is_banner(line: &str) -> bool {
    line.matches('=').count() >= BANNER_MIN_EQUALS
}

/// Split a raw controller log into sections.
///
/// Banner lines close the current section, rule lines are dropped, and
/// sections with nothing but blank lines are discarded. Input without any
/// separator comes back as a single section.
pub fn excerpt(log: &str) -> Vec<Vec<String>> {
    let mut sections = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for line in log.lines() {
        if is_banner(line) {
            push_section(&mut sections, std::mem::take(&mut current));
        } else if !is_separator(line) {
            current.push(line.to_string());
        }
    }
    push_section(&mut sections, current);

    sections
}

fn push_section(sections: &mut Vec<Vec<String>>, section: Vec<String>) {
    if section.iter().any(|line| !line.trim().is_empty()) {
        sections.push(section);
    }
}

fn render_boards(boards: &[BoardReport]) -> String {
    let mut text = String::new();

    for board in boards {
        let _ = writeln!(text, "### {}: {}", board.board, board.outcome.label());
        if let Some(details) = board.outcome.details() {
            let _ = writeln!(text, "\n{details}");
        }

        if !board.tests.is_empty() {
            text.push('\n');
            for test in &board.tests {
                let result = if test.passed { "passed" } else { "failed" };
                let _ = writeln!(text, "- `{}`: {result}", test.name);
            }
        }

        if board.outcome.is_failure() && !board.log.is_empty() {
            text.push_str("\n```text\n");
            for line in board.log.iter().flatten() {
                let _ = writeln!(text, "{line}");
            }
            text.push_str("```\n");
        }
        text.push('\n');
    }

    text
}

/// `completed_at` as `YYYY-MM-DDTHH:MM:SSZ`.
mod utc_seconds {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn board(name: &str, outcome: BoardOutcome) -> BoardReport {
        BoardReport::new(name, outcome, Vec::new(), "")
    }

    #[test]
    fn any_failed_board_fails_the_run() {
        let boards = vec![
            board("metro_m4_express", BoardOutcome::Passed),
            board("feather_nrf52840", BoardOutcome::Failed("2 tests failed".into())),
        ];
        assert_eq!(conclude(&boards), Conclusion::Failure);
    }

    #[test]
    fn errored_board_fails_the_run() {
        let boards = vec![
            board("metro_m4_express", BoardOutcome::Error("no board".into())),
            board("feather_nrf52840", BoardOutcome::Passed),
        ];
        assert_eq!(conclude(&boards), Conclusion::Failure);
    }

    #[test]
    fn all_passed_succeeds() {
        let boards = vec![board("metro_m4_express", BoardOutcome::Passed)];
        assert_eq!(conclude(&boards), Conclusion::Success);
    }

    #[test]
    fn separator_thresholds() {
        assert!(is_separator(&"=".repeat(25)));
        assert!(!is_separator(&"=".repeat(24)));
        assert!(is_separator(&"-".repeat(60)));
        assert!(!is_separator(&"-".repeat(59)));
        assert!(!is_separator("test_digitalio ... ok"));
    }

    #[test]
    fn excerpt_splits_on_banners_and_drops_rules() {
        let log = format!(
            "preamble\n{eq}\nStarting test: digitalio\nresult: ok\n{dash}\n{eq}\nStarting test: analogio\nresult: fail\n",
            eq = "=".repeat(30),
            dash = "-".repeat(70),
        );

        let sections = excerpt(&log);
        assert_eq!(
            sections,
            vec![
                vec!["preamble".to_string()],
                vec!["Starting test: digitalio".to_string(), "result: ok".to_string()],
                vec!["Starting test: analogio".to_string(), "result: fail".to_string()],
            ]
        );
        assert!(sections.iter().flatten().all(|line| !is_separator(line)));
    }

    #[test]
    fn excerpt_is_identity_on_clean_input() {
        let log = "line one\nline two\n  indented";
        let once = excerpt(log);
        assert_eq!(once, vec![vec!["line one", "line two", "  indented"]]);

        let joined = once.iter().flatten().cloned().collect::<Vec<_>>().join("\n");
        assert_eq!(excerpt(&joined), once);
    }

    #[test]
    fn excerpt_of_only_separators_is_empty() {
        let log = format!("{}\n{}\n", "=".repeat(40), "-".repeat(80));
        assert!(excerpt(&log).is_empty());
    }

    #[test]
    fn outcome_names_boards_and_commit() {
        let assembler = ReportAssembler::new("https://example.invalid/commit/");
        let completed_at = Utc.with_ymd_and_hms(2026, 10, 18, 12, 30, 0).unwrap();
        let boards = vec![BoardReport::new(
            "metro_m4_express",
            BoardOutcome::Passed,
            vec![TestCase {
                name: "digitalio".to_string(),
                passed: true,
            }],
            "ok",
        )];

        let outcome = assembler.assemble_at("abc123def", boards, completed_at);
        assert_eq!(outcome.conclusion, Conclusion::Success);
        assert_eq!(outcome.output.title, "RosiePi");
        assert!(outcome.output.text.contains("metro_m4_express"));
        assert!(outcome.output.text.contains("`digitalio`: passed"));
        assert!(outcome.output.summary.contains("[abc12]"));
        assert!(outcome.output.summary.contains("https://example.invalid/commit/abc123def"));

        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["conclusion"], "success");
        assert_eq!(value["completed_at"], "2026-10-18T12:30:00Z");
        assert_eq!(value["boards"][0]["outcome"]["status"], "passed");
    }

    #[test]
    fn failed_board_text_includes_log_excerpt() {
        let assembler = ReportAssembler::new("https://example.invalid/commit/");
        let log = format!("{}\nassert failed: pin D5\n", "=".repeat(30));
        let boards = vec![BoardReport::new(
            "feather_nrf52840",
            BoardOutcome::Failed("1 test failed".into()),
            Vec::new(),
            &log,
        )];

        let outcome = assembler.assemble("abc123", boards);
        assert_eq!(outcome.conclusion, Conclusion::Failure);
        assert!(outcome.output.text.contains("feather_nrf52840: Failed"));
        assert!(outcome.output.text.contains("assert failed: pin D5"));
        assert!(!outcome.output.text.contains("====="));
    }

    #[test]
    fn outcome_survives_storage_encoding() {
        let assembler = ReportAssembler::new("https://example.invalid/commit/");
        let completed_at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let outcome = assembler.assemble_at(
            "abc123",
            vec![board("metro_m4_express", BoardOutcome::Error("timeout".into()))],
            completed_at,
        );

        let json = serde_json::to_string(&outcome).unwrap();
        let decoded: Outcome = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, outcome);
    }
}
