//! Configuration types for the queue client.
//!
//! These are plain serde structs; the embedding application owns where they
//! are deserialized from. Every field has a default, so `Config::default()`
//! is a working configuration.

mod defaults;
mod validation;

pub use validation::validate;

use defaults::{
    default_ack_failed_jobs, default_enable_file_logging, default_fetch_error_backoff_ms,
    default_fetch_timeout_secs, default_lock_ttl_ms, default_log_dir, default_log_filename,
    default_log_format, default_rotation, default_watchdog_tick_ms,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Root configuration for producers and consumers.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Processing-loop tuning.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConsumerConfig {
    /// Blocking-fetch timeout in seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Visibility watchdog wake interval in milliseconds.
    #[serde(default = "default_watchdog_tick_ms")]
    pub watchdog_tick_ms: u64,
    /// Pause after a failed fetch before the loop tries again, in
    /// milliseconds.
    #[serde(default = "default_fetch_error_backoff_ms")]
    pub fetch_error_backoff_ms: u64,
    /// Acknowledge jobs whose processor returned an error. When `false`,
    /// failed jobs are left un-acked and redelivered after their retry
    /// window.
    #[serde(default = "default_ack_failed_jobs")]
    pub ack_failed_jobs: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
            watchdog_tick_ms: default_watchdog_tick_ms(),
            fetch_error_backoff_ms: default_fetch_error_backoff_ms(),
            ack_failed_jobs: default_ack_failed_jobs(),
        }
    }
}

impl ConsumerConfig {
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    #[must_use]
    pub const fn watchdog_tick(&self) -> Duration {
        Duration::from_millis(self.watchdog_tick_ms)
    }

    #[must_use]
    pub const fn fetch_error_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_error_backoff_ms)
    }
}

/// Distributed-lock tuning.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LockConfig {
    /// Nominal TTL of each per-job lock in milliseconds.
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_lock_ttl_ms(),
        }
    }
}

impl LockConfig {
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Directory path for log files.
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Log file base name.
    #[serde(default = "default_log_filename")]
    pub filename: String,
    /// Rotation policy: "daily" (default), "hourly", or "never".
    #[serde(default = "default_rotation")]
    pub rotation: String,
    /// Optional tracing level; when unset, `RUST_LOG` is consulted with an
    /// "info" fallback.
    #[serde(default)]
    pub level: Option<LogLevel>,
    /// Enable rolling file logging in addition to stdout logs.
    #[serde(default = "default_enable_file_logging")]
    pub enable_file_logging: bool,
    /// Format for rendered logs.
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            filename: default_log_filename(),
            rotation: default_rotation(),
            level: None,
            enable_file_logging: default_enable_file_logging(),
            format: default_log_format(),
        }
    }
}

/// Log level enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" | "err" => Ok(Self::Error),
            other => Err(serde::de::Error::custom(format!(
                "invalid log level '{other}', expected one of: trace, debug, info, warn, error"
            ))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log format enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}
