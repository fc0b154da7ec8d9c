//! Stable exit codes for the `tapci` binary.

/// No step failed.
pub const OK: i32 = 0;
/// A step failed, fail-fast aborted the run, or a runtime error occurred.
pub const FAILED: i32 = 1;
/// Invalid invocation: conflicting flags or nothing to test.
pub const USAGE: i32 = 2;
