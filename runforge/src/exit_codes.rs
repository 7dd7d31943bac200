//! Stable exit codes for runforge CLI commands.

/// Command succeeded; for `run`, the pipeline exited with code 0.
pub const OK: i32 = 0;
/// Invalid arguments, config or run id, or any other error.
pub const INVALID: i32 = 1;
/// `runforge run`: the pipeline exited with a non-zero code.
pub const PIPELINE_FAILED: i32 = 2;
/// `runforge run`: the run was cancelled.
pub const CANCELLED: i32 = 3;
/// `runforge run`: private-mode archival failed; plaintext output kept.
pub const ARCHIVE_FAILED: i32 = 4;
/// `runforge restore`: credentials do not match the archive.
pub const CREDENTIAL_MISMATCH: i32 = 5;
