#![cfg_attr(not(test), deny(clippy::panic))]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::similar_names
)]

//! # Remora Queue
//!
//! A distributed job-queue client library: delayed enqueue on the producer
//! side, and a consumer-side execution engine that fetches jobs, gates each
//! one on a quorum-held distributed lock, keeps it visible while a user
//! processor runs, and acknowledges it afterwards.
//!
//! At most one processor invocation runs for a given job at any instant
//! across the whole consumer fleet; under ack loss a job may run again
//! later, but never concurrently.

/// Contracts for the queue and lock clusters, with in-memory backends
pub mod cluster;

/// Configuration types and validation
pub mod config;

/// Consumer facade and per-queue processing loops
pub mod consumer;

/// Error types for cluster operations
pub mod error;

/// Job identifiers, payloads, and enqueue options
pub mod job;

/// Quorum-based distributed locking
pub mod lock;

/// Structured logging configuration
pub mod logging;

/// Metrics collection and reporting
pub mod metrics;

/// Producer-side enqueue handle
pub mod producer;

/// Queue-name to processor routing
pub mod registry;

/// Retry logic utilities
pub mod retry;

/// Visibility extension for in-flight jobs
pub mod watchdog;
