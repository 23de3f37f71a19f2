//! The job queue contract.

use std::time::Duration;

use async_trait::async_trait;
use reel_models::{AttemptRecord, DownloadArtifact, Job, JobId};
use serde::Serialize;

use crate::backoff::BackoffPolicy;
use crate::error::QueueResult;

/// A job handed to one consumer.
///
/// The queue guarantees that only the holder of the current delivery can
/// settle the job; a delivery whose lease expired is rejected with
/// `QueueError::LeaseLost`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: Job,
    /// Backend receipt (stream entry ID for Redis)
    pub receipt: String,
    pub consumer: String,
}

impl Delivery {
    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }
}

/// Why a delivery failed.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub message: String,
    /// Terminal failures skip the retry schedule
    pub terminal: bool,
    pub history: Vec<AttemptRecord>,
}

impl JobFailure {
    pub fn retryable(message: impl Into<String>, history: Vec<AttemptRecord>) -> Self {
        Self {
            message: message.into(),
            terminal: false,
            history,
        }
    }

    pub fn terminal(message: impl Into<String>, history: Vec<AttemptRecord>) -> Self {
        Self {
            message: message.into(),
            terminal: true,
            history,
        }
    }
}

/// Result of a `nack`.
#[derive(Debug, Clone, PartialEq)]
pub enum NackDisposition {
    /// Scheduled for another delivery after `delay`
    Retry { attempt: u32, delay: Duration },
    /// Marked failed and copied to the dead letter stream
    Failed { job: Job },
}

/// Apply a failed delivery to the job record.
///
/// Counts the attempt, then either parks the job for a retry (it stays
/// `active`) or marks it `failed`. Returns the retry delay when one was
/// scheduled.
pub(crate) fn apply_failure(
    job: &mut Job,
    failure: &JobFailure,
    policy: &BackoffPolicy,
) -> QueueResult<Option<(u32, Duration)>> {
    let attempt = job.record_failed_attempt();

    if failure.terminal || !policy.allows_retry(attempt) {
        job.fail(failure.message.clone(), failure.history.clone())?;
        return Ok(None);
    }

    let delay = policy.delay_for_attempt(attempt);
    let at = chrono::Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    job.schedule_retry(failure.message.clone(), failure.history.clone(), at)?;
    Ok(Some((attempt, delay)))
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Entries waiting in the stream (including in-flight ones)
    pub queued: u64,
    /// Entries delivered but not yet settled
    pub in_flight: u64,
    /// Jobs parked until their retry time
    pub delayed: u64,
    pub dead_lettered: u64,
}

/// Durable work queue for download jobs.
///
/// Mutual exclusion is the queue's job: at most one consumer holds a job
/// at a time, and a delivery that is neither settled nor heartbeated within
/// the visibility timeout becomes eligible for redelivery.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Prepare backend structures (idempotent).
    async fn init(&self) -> QueueResult<()>;

    /// Store a `queued` job and make it visible to consumers.
    async fn enqueue(&self, job: Job) -> QueueResult<JobId>;

    /// Wait up to `block` for a job and mark it `active`.
    async fn dequeue(&self, consumer: &str, block: Duration) -> QueueResult<Option<Delivery>>;

    /// Extend the lease of an in-flight delivery.
    async fn heartbeat(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Mark the job `succeeded`.
    async fn ack(&self, delivery: &Delivery, artifact: DownloadArtifact) -> QueueResult<Job>;

    /// Schedule a retry or fail the job terminally.
    async fn nack(&self, delivery: &Delivery, failure: JobFailure) -> QueueResult<NackDisposition>;

    /// Look up a job by ID.
    async fn get(&self, job_id: &JobId) -> QueueResult<Option<Job>>;

    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Release the broker handle; later calls fail with `QueueError::Closed`.
    async fn close(&self) -> QueueResult<()>;
}
