//! Per-unit, per-project and per-run results.

use crate::error::ErrorKind;
use crate::state::{ProjectState, Transition};
use chrono::{DateTime, Utc};
use convenient_process::LogRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Exit code when the only problem was cancellation.
pub const EXIT_CANCELLED: i32 = 130;

/// How a unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitOutcome {
    /// Both steps succeeded.
    Succeeded,
    /// A step failed.
    Failed,
    /// Stopped by the operator or fail-fast.
    Cancelled,
    /// Never started.
    Skipped,
}

/// Result of one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitResult {
    /// Unit name (`ro`, `rw`, `singleimage`).
    pub unit: String,
    /// Exit code of the last step that ran.
    pub exit_code: Option<i32>,
    /// Final outcome.
    pub outcome: UnitOutcome,
    /// Warnings and errors the unit printed.
    pub diagnostics: Vec<LogRecord>,
    /// Wall-clock time across both steps.
    pub duration_ms: u64,
}

/// One packed or signed output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// File name inside the output directory.
    pub name: String,
    /// Absolute path.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Hex SHA-256.
    pub sha256: String,
}

/// Result of one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectResult {
    /// Project name.
    pub project: String,
    /// Terminal state.
    pub state: ProjectState,
    /// Error class when not succeeded.
    pub error_kind: Option<ErrorKind>,
    /// Error message when not succeeded.
    pub error: Option<String>,
    /// Unit results.
    pub units: Vec<UnitResult>,
    /// Output files.
    pub artifacts: Vec<Artifact>,
    /// Every state entered.
    pub transitions: Vec<Transition>,
    /// Wall-clock time.
    pub duration_ms: u64,
}

impl ProjectResult {
    /// All units succeeded and the project reached `Succeeded`.
    pub fn succeeded(&self) -> bool {
        self.state == ProjectState::Succeeded
    }
}

/// Result of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Projects in name order.
    pub projects: Vec<ProjectResult>,
    /// The operator interrupted the run.
    pub cancelled: bool,
    /// Run start.
    pub started: DateTime<Utc>,
    /// Run end (after the log barrier).
    pub finished: DateTime<Utc>,
}

impl RunResult {
    /// Names of failed projects.
    pub fn failed_projects(&self) -> Vec<&str> {
        self.in_state(ProjectState::Failed)
    }

    /// Names of cancelled projects.
    pub fn cancelled_projects(&self) -> Vec<&str> {
        self.in_state(ProjectState::Cancelled)
    }

    fn in_state(&self, state: ProjectState) -> Vec<&str> {
        self.projects
            .iter()
            .filter(|p| p.state == state)
            .map(|p| p.project.as_str())
            .collect()
    }

    /// Every selected project succeeded.
    pub fn succeeded(&self) -> bool {
        self.projects.iter().all(ProjectResult::succeeded)
    }

    /// 0 on success, 1 on any failure, [`EXIT_CANCELLED`] when only
    /// cancellations occurred (unless those count as failures).
    pub fn exit_code(&self, cancelled_is_failure: bool) -> i32 {
        if self.succeeded() {
            0
        } else if !self.failed_projects().is_empty() || cancelled_is_failure {
            1
        } else {
            EXIT_CANCELLED
        }
    }

    /// Result for one project.
    pub fn project(&self, name: &str) -> Option<&ProjectResult> {
        self.projects.iter().find(|p| p.project == name)
    }

    /// Write the JSON report.
    pub fn write_report(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Build Summary")?;
        writeln!(f, "───────────────────────────────────")?;
        for project in &self.projects {
            write!(
                f,
                "{:16} {:24} ({:.2}s)",
                project.state.to_string(),
                project.project,
                project.duration_ms as f64 / 1000.0
            )?;
            if let Some(error) = &project.error {
                write!(f, "  {}", error)?;
            }
            writeln!(f)?;
        }

        let failed = self.failed_projects();
        let cancelled = self.cancelled_projects();
        writeln!(f)?;
        writeln!(
            f,
            "{} projects, {} succeeded, {} failed, {} cancelled",
            self.projects.len(),
            self.projects.iter().filter(|p| p.succeeded()).count(),
            failed.len(),
            cancelled.len()
        )?;
        if !failed.is_empty() {
            writeln!(f, "Failed: {}", failed.join(" "))?;
        }
        Ok(())
    }
}
