//! Core job types shared by producers, consumers, and the cluster contracts.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Identifier assigned by the queue cluster when a job is enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Mint a fresh identifier. Only queue backends assign ids.
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A job as delivered by the queue cluster.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Queue the job was enqueued on; producers and consumers rendezvous on
    /// equal strings.
    pub queue: String,
    /// Opaque payload. The library never inspects it.
    pub body: Bytes,
    /// Redelivery window: an un-acked job whose visibility is not extended
    /// within this duration is handed to another consumer.
    pub retry: Duration,
}

/// Options honored by [`crate::cluster::QueueCluster::add`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Redelivery window for the job once claimed by a consumer.
    pub retry: Duration,
    /// Optional absolute lifetime; the cluster drops the job once it has
    /// been pending longer than this without being acked.
    pub ttl: Option<Duration>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            retry: Duration::from_secs(30),
            ttl: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_unique() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn job_id_display_matches_uuid() {
        let id = JobId::generate();
        assert_eq!(id.to_string(), id.as_uuid().to_string());
    }

    #[test]
    fn default_enqueue_options() {
        let options = EnqueueOptions::default();
        assert_eq!(options.retry, Duration::from_secs(30));
        assert!(options.ttl.is_none());
    }
}
