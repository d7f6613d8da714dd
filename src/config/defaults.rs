//! Default value functions for configuration fields, used by serde's
//! `#[serde(default = ...)]` attributes.

use super::LogFormat;

// =============================================================================
// Consumer Defaults
// =============================================================================

/// Blocking-fetch timeout. Also bounds how long `stop()` takes to be
/// observed by an idle processing loop.
pub const fn default_fetch_timeout_secs() -> u64 {
    5
}

pub const fn default_watchdog_tick_ms() -> u64 {
    10
}

pub const fn default_fetch_error_backoff_ms() -> u64 {
    1000
}

pub const fn default_ack_failed_jobs() -> bool {
    true
}

// =============================================================================
// Lock Defaults
// =============================================================================

pub const fn default_lock_ttl_ms() -> u64 {
    10_000
}

// =============================================================================
// Logging Defaults
// =============================================================================

pub fn default_log_dir() -> String {
    "logs".to_string()
}

pub fn default_log_filename() -> String {
    "remora-queue.log".to_string()
}

pub fn default_rotation() -> String {
    "daily".to_string()
}

pub const fn default_enable_file_logging() -> bool {
    false
}

pub const fn default_log_format() -> LogFormat {
    LogFormat::Text
}
