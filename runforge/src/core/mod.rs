//! Deterministic, pure logic shared by the run supervisor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod lifecycle;
pub mod lines;
pub mod markers;
pub mod run_id;
pub mod types;
