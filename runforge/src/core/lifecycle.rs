//! Run lifecycle state machine.
//!
//! ```text
//! Running ──exit 0──────────▶ CompletedSuccess ─┐
//!    │    ──exit != 0───────▶ CompletedFailure ─┼─(private mode)─▶ Archived | ArchiveFailed
//!    └────cancel───────────▶ Cancelled ────────┘ (only with archive_cancelled)
//! ```
//!
//! Decisions are pure; the supervisor applies them (log marker, sidecar, archival
//! hand-off). Every decision function returns `None` for notifications that arrive
//! after the run already left the source state, which makes duplicate exit or
//! archival notifications no-ops.

use crate::core::markers::TerminalMarker;
use crate::core::types::RunStatus;

/// Policy knobs that influence lifecycle decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchivePolicy {
    /// Archive cancelled runs too (private mode only). Off by default: a cancelled run
    /// keeps its partial plaintext output.
    pub archive_cancelled: bool,
}

/// What to do when the engine process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitDecision {
    pub status: RunStatus,
    /// Marker to append to the log. `None` for cancelled runs: the cancellation
    /// marker was written before any signal was sent.
    pub marker: Option<TerminalMarker>,
    /// Hand the run directory to the archival worker.
    pub archive: bool,
}

/// Decide the outcome of a process exit.
pub fn decide_exit(
    current: RunStatus,
    cancel_requested: bool,
    exit_code: i32,
    private: bool,
    policy: ArchivePolicy,
) -> Option<ExitDecision> {
    if current != RunStatus::Running {
        return None;
    }
    if cancel_requested {
        return Some(ExitDecision {
            status: RunStatus::Cancelled,
            marker: None,
            archive: private && policy.archive_cancelled,
        });
    }
    let status = if exit_code == 0 {
        RunStatus::CompletedSuccess
    } else {
        RunStatus::CompletedFailure
    };
    Some(ExitDecision {
        status,
        marker: Some(TerminalMarker::ExitCode(exit_code)),
        archive: private,
    })
}

/// Decide the status after the archival worker reports back.
pub fn decide_archival(current: RunStatus, succeeded: bool) -> Option<RunStatus> {
    let next = if succeeded {
        RunStatus::Archived
    } else {
        RunStatus::ArchiveFailed
    };
    current.can_transition_to(next).then_some(next)
}
