//! Shared deterministic types for run orchestration.
//!
//! These types define stable contracts between the supervisor, the on-disk store
//! and the CLI. They must not depend on external state or I/O.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a single run.
///
/// Statuses only move forward (see [`RunStatus::can_transition_to`]). A re-run always
/// allocates a new run id instead of rewinding an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    /// The engine process is alive.
    Running,
    /// The user cancelled the run.
    Cancelled,
    /// The engine exited with code 0.
    CompletedSuccess,
    /// The engine exited with a non-zero code.
    CompletedFailure,
    /// The run directory was replaced by its encrypted archive.
    Archived,
    /// Archival failed; the plaintext run directory is still on disk.
    ArchiveFailed,
}

impl RunStatus {
    /// Returns true if the status can never change again.
    ///
    /// Completed and cancelled runs may still move to an archival status, so only the
    /// archival outcomes are final in every operating mode.
    pub fn is_final(self) -> bool {
        matches!(self, RunStatus::Archived | RunStatus::ArchiveFailed)
    }

    /// Returns true once the engine process is gone.
    pub fn is_process_terminal(self) -> bool {
        self != RunStatus::Running
    }

    /// Forward-only transition table of the lifecycle state machine.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::{
            Archived, ArchiveFailed, Cancelled, CompletedFailure, CompletedSuccess, Running,
        };
        matches!(
            (self, next),
            (Running, Cancelled | CompletedSuccess | CompletedFailure)
                | (
                    CompletedSuccess | CompletedFailure | Cancelled,
                    Archived | ArchiveFailed
                )
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Cancelled => "cancelled",
            RunStatus::CompletedSuccess => "completed-success",
            RunStatus::CompletedFailure => "completed-failure",
            RunStatus::Archived => "archived",
            RunStatus::ArchiveFailed => "archive-failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a run, published to waiters on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSnapshot {
    pub status: RunStatus,
    /// Exit code of the engine process, once known.
    pub exit_code: Option<i32>,
    /// True once the process is gone and no archival is pending.
    pub settled: bool,
}

impl RunSnapshot {
    pub fn running() -> Self {
        Self {
            status: RunStatus::Running,
            exit_code: None,
            settled: false,
        }
    }
}

/// Which standard stream a chunk of process output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A single pipeline parameter value as written to `params.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    Text(String),
}

impl ParamValue {
    /// Parse a CLI value: `true`/`false` become flags, everything else stays text.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "true" => ParamValue::Flag(true),
            "false" => ParamValue::Flag(false),
            other => ParamValue::Text(other.to_string()),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Flag(value)
    }
}

/// Parameter mapping consumed by the engine (ordered for stable output).
pub type Params = BTreeMap<String, ParamValue>;
