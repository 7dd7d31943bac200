//! Terminal marker lines written to run logs.
//!
//! The marker text is a stable wire format: status coloring in older tooling matches
//! on `<<exit-code:N>>` and `cancelled by user` substrings, so the exact wording must
//! not change.

use crate::core::types::RunStatus;

/// Header line prefix that opens every run log.
pub const HEADER_PREFIX: &str = "Running pipeline: ";

/// Marker line recorded when the user cancels a run.
pub const CANCELLED_LINE: &str = "Pipeline run cancelled by user.";

const EXIT_OPEN: &str = "<<exit-code:";
const EXIT_CLOSE: &str = ">>";
/// Phrase older versions wrote when a user cancelled a run.
const LEGACY_CANCELLED: &str = "cancelled by user";

/// The single line that records how a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMarker {
    ExitCode(i32),
    Cancelled,
}

impl TerminalMarker {
    pub fn line(self) -> String {
        match self {
            TerminalMarker::ExitCode(code) => {
                format!("Pipeline run completed {EXIT_OPEN}{code}{EXIT_CLOSE}.")
            }
            TerminalMarker::Cancelled => CANCELLED_LINE.to_string(),
        }
    }

    /// Parse a log line; only exact marker lines match.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end();
        if line == CANCELLED_LINE {
            return Some(TerminalMarker::Cancelled);
        }
        let rest = line.strip_prefix("Pipeline run completed ")?;
        let rest = rest.strip_suffix('.')?;
        let code = rest.strip_prefix(EXIT_OPEN)?.strip_suffix(EXIT_CLOSE)?;
        code.parse().ok().map(TerminalMarker::ExitCode)
    }
}

/// Count terminal marker lines in a log.
pub fn count_terminal_markers(log: &str) -> usize {
    log.lines()
        .filter(|line| TerminalMarker::parse(line).is_some())
        .count()
}

/// Last terminal marker in a log, if any.
pub fn last_terminal_marker(log: &str) -> Option<TerminalMarker> {
    log.lines().rev().find_map(TerminalMarker::parse)
}

/// Infer a status from log text alone.
///
/// Used for logs without a status sidecar. Falls back to substring matching so that
/// logs written by older versions (e.g. `... <<exit-code:1>>.` inside other text) are
/// still classified.
pub fn infer_status_from_log(log: &str) -> RunStatus {
    if let Some(marker) = last_terminal_marker(log) {
        return match marker {
            TerminalMarker::Cancelled => RunStatus::Cancelled,
            TerminalMarker::ExitCode(0) => RunStatus::CompletedSuccess,
            TerminalMarker::ExitCode(_) => RunStatus::CompletedFailure,
        };
    }

    let lower = log.to_lowercase();
    if let Some(idx) = lower.rfind(EXIT_OPEN) {
        let tail = &lower[idx + EXIT_OPEN.len()..];
        let code = tail.split(EXIT_CLOSE).next().unwrap_or_default();
        return if code.trim() == "0" {
            RunStatus::CompletedSuccess
        } else {
            RunStatus::CompletedFailure
        };
    }
    if lower.contains(LEGACY_CANCELLED) {
        return RunStatus::Cancelled;
    }
    RunStatus::Running
}
