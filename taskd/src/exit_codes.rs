//! Stable exit codes for taskd CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid config, an unreadable record or other errors.
pub const INVALID: i32 = 1;
/// `taskd tick` ran but at least one record could not be processed.
pub const PARTIAL: i32 = 2;
