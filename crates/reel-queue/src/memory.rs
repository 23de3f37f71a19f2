//! In-process job queue.
//!
//! Same contract as the Redis queue (leases, visibility timeout, delayed
//! retries, dead letters) without a broker. Used for local runs and tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use reel_models::{DownloadArtifact, Job, JobId, JobStatus};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::queue::{apply_failure, Delivery, JobFailure, JobQueue, NackDisposition, QueueStats};

struct Lease {
    consumer: String,
    receipt: String,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    ready: VecDeque<JobId>,
    leases: HashMap<JobId, Lease>,
    delayed: Vec<(Instant, JobId)>,
    dead_letters: Vec<(JobId, String)>,
    /// Settled jobs in settle order with the instant they may be forgotten
    expiries: VecDeque<(Instant, JobId)>,
    next_receipt: u64,
    closed: bool,
}

impl State {
    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Forget settled jobs whose retention has elapsed.
    fn purge_expired(&mut self, now: Instant) {
        let mut purged = Vec::new();
        while let Some((at, _)) = self.expiries.front() {
            if *at > now {
                break;
            }
            if let Some((_, job_id)) = self.expiries.pop_front() {
                self.jobs.remove(&job_id);
                purged.push(job_id);
            }
        }
        if !purged.is_empty() {
            self.dead_letters.retain(|(id, _)| !purged.contains(id));
            debug!(count = purged.len(), "Purged expired job records");
        }
    }

    fn settled(&mut self, job_id: JobId, retention: Duration) {
        if !retention.is_zero() {
            self.expiries.push_back((Instant::now() + retention, job_id));
        }
    }

    fn promote_due(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = pending;
        for (_, job_id) in due {
            debug!(job_id = %job_id, "Promoting delayed job");
            self.ready.push_back(job_id);
        }
    }

    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<JobId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for job_id in expired {
            if let Some(lease) = self.leases.remove(&job_id) {
                warn!(
                    job_id = %job_id,
                    consumer = %lease.consumer,
                    "Lease expired, job eligible for redelivery"
                );
                self.ready.push_front(job_id);
            }
        }
    }

    fn take_next(&mut self, consumer: &str, lease_deadline: Instant) -> QueueResult<Option<Delivery>> {
        while let Some(job_id) = self.ready.pop_front() {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.status.is_terminal() {
                debug!(job_id = %job_id, "Skipping settled job");
                continue;
            }

            job.activate()?;
            self.next_receipt += 1;
            let receipt = format!("{}-{}", job_id, self.next_receipt);
            self.leases.insert(
                job_id.clone(),
                Lease {
                    consumer: consumer.to_string(),
                    receipt: receipt.clone(),
                    deadline: lease_deadline,
                },
            );

            return Ok(Some(Delivery {
                job: job.clone(),
                receipt,
                consumer: consumer.to_string(),
            }));
        }
        Ok(None)
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|(at, _)| *at);
        let leases = self.leases.values().map(|lease| lease.deadline);
        delayed.chain(leases).min()
    }

    fn check_lease(&self, delivery: &Delivery) -> QueueResult<()> {
        match self.leases.get(delivery.job_id()) {
            Some(lease)
                if lease.receipt == delivery.receipt && lease.consumer == delivery.consumer =>
            {
                Ok(())
            }
            _ => Err(QueueError::LeaseLost(delivery.job_id().to_string())),
        }
    }
}

/// In-process job queue.
pub struct MemoryJobQueue {
    state: Mutex<State>,
    available: Notify,
    visibility_timeout: Duration,
    backoff: BackoffPolicy,
    /// How long settled jobs stay queryable; zero keeps them forever
    retention: Duration,
}

impl MemoryJobQueue {
    pub fn new(visibility_timeout: Duration, backoff: BackoffPolicy) -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: Notify::new(),
            visibility_timeout,
            backoff,
            retention: QueueConfig::default().job_retention,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.visibility_timeout, config.backoff.clone())
            .with_retention(config.job_retention)
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn init(&self) -> QueueResult<()> {
        self.state.lock().await.ensure_open()
    }

    async fn enqueue(&self, job: Job) -> QueueResult<JobId> {
        if job.status != JobStatus::Queued {
            return Err(QueueError::enqueue_failed(format!(
                "job {} is {}, expected queued",
                job.id, job.status
            )));
        }

        let job_id = job.id.clone();
        {
            let mut state = self.state.lock().await;
            state.ensure_open()?;
            state.purge_expired(Instant::now());
            if state.jobs.contains_key(&job_id) {
                return Err(QueueError::enqueue_failed(format!("duplicate job {}", job_id)));
            }
            state.jobs.insert(job_id.clone(), job);
            state.ready.push_back(job_id.clone());
        }
        self.available.notify_one();

        info!(job_id = %job_id, "Enqueued job");
        Ok(job_id)
    }

    async fn dequeue(&self, consumer: &str, block: Duration) -> QueueResult<Option<Delivery>> {
        let deadline = Instant::now() + block;

        loop {
            let wake_at = {
                let mut state = self.state.lock().await;
                state.ensure_open()?;

                let now = Instant::now();
                state.purge_expired(now);
                state.promote_due(now);
                state.reclaim_expired(now);

                if let Some(delivery) = state.take_next(consumer, now + self.visibility_timeout)? {
                    debug!(job_id = %delivery.job_id(), consumer = %consumer, "Dequeued job");
                    return Ok(Some(delivery));
                }

                if now >= deadline {
                    return Ok(None);
                }
                state
                    .next_wakeup()
                    .map_or(deadline, |at| at.min(deadline))
            };

            let _ = tokio::time::timeout_at(wake_at, self.available.notified()).await;
        }
    }

    async fn heartbeat(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.check_lease(delivery)?;
        if let Some(lease) = state.leases.get_mut(delivery.job_id()) {
            lease.deadline = Instant::now() + self.visibility_timeout;
        }
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery, artifact: DownloadArtifact) -> QueueResult<Job> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.check_lease(delivery)?;

        let job_id = delivery.job_id().clone();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        job.succeed(artifact)?;
        let job = job.clone();
        state.leases.remove(&job_id);
        state.settled(job_id.clone(), self.retention);

        info!(job_id = %job_id, "Acknowledged job");
        Ok(job)
    }

    async fn nack(&self, delivery: &Delivery, failure: JobFailure) -> QueueResult<NackDisposition> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.check_lease(delivery)?;

        let job_id = delivery.job_id().clone();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        let plan = apply_failure(job, &failure, &self.backoff)?;
        let job = job.clone();
        state.leases.remove(&job_id);

        match plan {
            Some((attempt, delay)) => {
                state.delayed.push((Instant::now() + delay, job_id.clone()));
                info!(job_id = %job_id, attempt, delay_ms = delay.as_millis() as u64, "Scheduled retry");
                Ok(NackDisposition::Retry { attempt, delay })
            }
            None => {
                state.dead_letters.push((job_id.clone(), failure.message.clone()));
                state.settled(job_id.clone(), self.retention);
                warn!(job_id = %job_id, "Moved job to DLQ: {}", failure.message);
                Ok(NackDisposition::Failed { job })
            }
        }
    }

    async fn get(&self, job_id: &JobId) -> QueueResult<Option<Job>> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.purge_expired(Instant::now());
        Ok(state.jobs.get(job_id).cloned())
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;
        state.purge_expired(Instant::now());
        Ok(QueueStats {
            queued: (state.ready.len() + state.leases.len()) as u64,
            in_flight: state.leases.len() as u64,
            delayed: state.delayed.len() as u64,
            dead_lettered: state.dead_letters.len() as u64,
        })
    }

    async fn close(&self) -> QueueResult<()> {
        self.state.lock().await.closed = true;
        self.available.notify_waiters();
        info!("In-memory queue closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_models::{AttemptRecord, DownloadMethod};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn queue() -> MemoryJobQueue {
        MemoryJobQueue::new(
            Duration::from_secs(30),
            BackoffPolicy {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                max_attempts: 3,
            },
        )
    }

    fn artifact() -> DownloadArtifact {
        DownloadArtifact {
            path: PathBuf::from("/tmp/reels/x.mp4"),
            method: DownloadMethod::UnauthenticatedDirect,
            elapsed_ms: 10,
            size_bytes: 1,
            attempts: vec![AttemptRecord::success(DownloadMethod::UnauthenticatedDirect, 10)],
        }
    }

    #[tokio::test]
    async fn test_settled_jobs_expire_after_retention() {
        let queue = queue().with_retention(Duration::from_millis(50));
        let done = queue.enqueue(Job::new("https://www.instagram.com/reel/a/")).await.unwrap();
        let dead = queue.enqueue(Job::new("https://www.instagram.com/reel/b/")).await.unwrap();
        let pending = queue.enqueue(Job::new("https://www.instagram.com/reel/c/")).await.unwrap();

        let first = queue.dequeue("c1", Duration::ZERO).await.unwrap().unwrap();
        queue.ack(&first, artifact()).await.unwrap();
        let second = queue.dequeue("c1", Duration::ZERO).await.unwrap().unwrap();
        queue
            .nack(&second, JobFailure::terminal("too large", Vec::new()))
            .await
            .unwrap();
        assert_eq!(queue.stats().await.unwrap().dead_lettered, 1);
        assert!(queue.get(&done).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(queue.get(&done).await.unwrap().is_none());
        assert!(queue.get(&dead).await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().dead_lettered, 0);
        // Unsettled jobs are never purged
        assert_eq!(
            queue.get(&pending).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_status_is_queued_before_pickup() {
        let queue = queue();
        let id = queue.enqueue(Job::new("https://www.instagram.com/reel/a/")).await.unwrap();
        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_non_queued_job() {
        let queue = queue();
        let mut job = Job::new("https://www.instagram.com/reel/a/");
        job.activate().unwrap();
        assert!(matches!(queue.enqueue(job).await, Err(QueueError::EnqueueFailed(_))));
    }

    #[tokio::test]
    async fn test_single_consumer_holds_job() {
        let queue = queue();
        queue.enqueue(Job::new("https://www.instagram.com/reel/a/")).await.unwrap();

        let first = queue.dequeue("w1", Duration::from_millis(10)).await.unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().job.status, JobStatus::Active);

        let second = queue.dequeue("w2", Duration::from_millis(10)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_ack_marks_succeeded_once() {
        let queue = queue();
        let id = queue.enqueue(Job::new("https://www.instagram.com/reel/a/")).await.unwrap();
        let delivery = queue.dequeue("w1", Duration::ZERO).await.unwrap().unwrap();

        let job = queue.ack(&delivery, artifact()).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.method, Some(DownloadMethod::UnauthenticatedDirect));

        assert!(matches!(
            queue.ack(&delivery, artifact()).await,
            Err(QueueError::LeaseLost(_))
        ));
        assert_eq!(queue.get(&id).await.unwrap().unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_schedules_retry_and_keeps_job_active() {
        let queue = queue();
        let id = queue.enqueue(Job::new("https://www.instagram.com/reel/a/")).await.unwrap();
        let delivery = queue.dequeue("w1", Duration::ZERO).await.unwrap().unwrap();

        let disposition = queue
            .nack(&delivery, JobFailure::retryable("upstream 429", Vec::new()))
            .await
            .unwrap();
        assert_eq!(
            disposition,
            NackDisposition::Retry { attempt: 1, delay: Duration::from_secs(1) }
        );

        let parked = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(parked.status, JobStatus::Active);
        assert_eq!(parked.attempts, 1);
        assert!(parked.next_attempt_at.is_some());
        assert_eq!(queue.stats().await.unwrap().delayed, 1);

        // Not visible before the delay elapses
        assert!(queue.dequeue("w1", Duration::from_millis(500)).await.unwrap().is_none());

        let redelivered = queue.dequeue("w2", Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(redelivered.job.id, id);
        assert_eq!(redelivered.job.status, JobStatus::Active);
        assert!(redelivered.job.next_attempt_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_ceiling_fails_job() {
        let queue = queue();
        let id = queue.enqueue(Job::new("https://www.instagram.com/reel/a/")).await.unwrap();

        for attempt in 1..=3 {
            let delivery = queue.dequeue("w1", Duration::from_secs(30)).await.unwrap().unwrap();
            let disposition = queue
                .nack(&delivery, JobFailure::retryable("unavailable", Vec::new()))
                .await
                .unwrap();
            if attempt < 3 {
                assert!(matches!(disposition, NackDisposition::Retry { .. }));
            } else {
                assert!(matches!(disposition, NackDisposition::Failed { .. }));
            }
        }

        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.error.as_deref(), Some("unavailable"));

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.delayed, 0);
        assert!(queue.dequeue("w1", Duration::from_secs(60)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_failure_skips_retries() {
        let queue = queue();
        let id = queue.enqueue(Job::new("https://www.instagram.com/reel/a/")).await.unwrap();
        let delivery = queue.dequeue("w1", Duration::ZERO).await.unwrap().unwrap();

        let disposition = queue
            .nack(&delivery, JobFailure::terminal("duration exceeds 300s", Vec::new()))
            .await
            .unwrap();
        assert!(matches!(disposition, NackDisposition::Failed { .. }));

        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_redelivered() {
        let queue = queue();
        queue.enqueue(Job::new("https://www.instagram.com/reel/a/")).await.unwrap();
        let stale = queue.dequeue("crashed", Duration::ZERO).await.unwrap().unwrap();

        let fresh = queue
            .dequeue("survivor", Duration::from_secs(31))
            .await
            .unwrap()
            .expect("redelivered after visibility timeout");
        assert_eq!(fresh.job.id, stale.job.id);
        assert_ne!(fresh.receipt, stale.receipt);

        // The original consumer can no longer settle the job
        assert!(matches!(
            queue.ack(&stale, artifact()).await,
            Err(QueueError::LeaseLost(_))
        ));
        assert!(queue.ack(&fresh, artifact()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_extends_lease() {
        let queue = queue();
        queue.enqueue(Job::new("https://www.instagram.com/reel/a/")).await.unwrap();
        let delivery = queue.dequeue("w1", Duration::ZERO).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        queue.heartbeat(&delivery).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert!(queue.dequeue("w2", Duration::ZERO).await.unwrap().is_none());
        assert!(queue.ack(&delivery, artifact()).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_consumers() {
        let queue = Arc::new(queue());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue("w1", Duration::from_secs(60)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await.unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(QueueError::Closed)));
        assert!(matches!(queue.stats().await, Err(QueueError::Closed)));
    }
}
