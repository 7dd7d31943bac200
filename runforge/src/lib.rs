//! Run orchestration for a desktop workflow-pipeline runner.
//!
//! A run launches an external workflow engine in its own working directory, streams
//! its output into an append-only log, and ends with exactly one terminal marker. In
//! private mode the finished run directory is then compressed and encrypted in the
//! background, and can later be restored with the same credentials.
//!
//! - **[`core`]**: Pure, deterministic logic (lifecycle decisions, marker format,
//!   run ids, line assembly). No I/O.
//! - **[`io`]**: Side-effecting helpers (run store, logs, engine process, archive and
//!   crypto files, config).
//!
//! [`supervisor`] wires both together on a tokio runtime; [`archival`] holds the
//! background archival and restore jobs.

pub mod archival;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
