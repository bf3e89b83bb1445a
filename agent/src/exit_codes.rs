//! Stable exit codes for fuzz-agent CLI commands.

/// Session ended without finding a bug, or a local command succeeded.
pub const OK: i32 = 0;
/// Invalid configuration, usage, or any other local error.
pub const INVALID: i32 = 1;
/// The connection to the orchestration service failed or went silent.
pub const TRANSPORT: i32 = 2;
/// Client and server disagree on the protocol.
pub const PROTOCOL: i32 = 3;
/// The service rejected the session (400/401/403/500).
pub const REJECTED: i32 = 4;
/// The service found a bug.
pub const BUG_FOUND: i32 = 6;
/// A shell stage failed during an otherwise clean run.
pub const EXEC_FAILED: i32 = 7;
