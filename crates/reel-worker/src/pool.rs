//! The worker pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reel_downloader::Cascade;
use reel_models::Job;
use reel_queue::{Delivery, JobFailure, JobQueue, NackDisposition, QueueError};
use reel_store::JobRecordStore;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics::{job_finished, job_started, record_job, record_queue_error};
use crate::notifier::{CompletionEvent, CompletionNotifier};

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<dyn JobQueue>,
    pub cascade: Arc<Cascade>,
    pub store: Arc<dyn JobRecordStore>,
    pub notifier: Arc<dyn CompletionNotifier>,
}

/// A running set of queue consumers.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
    consumers: Vec<String>,
}

impl WorkerPool {
    /// Spawn `config.concurrency` workers.
    pub fn start(ctx: WorkerContext, config: WorkerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let mut consumers = Vec::with_capacity(config.concurrency);
        let run_id = Uuid::new_v4().simple().to_string();

        for n in 0..config.concurrency.max(1) {
            let consumer = format!("worker-{}-{}", n, &run_id[..8]);
            consumers.push(consumer.clone());

            let worker = Worker {
                consumer,
                ctx: ctx.clone(),
                config: config.clone(),
                shutdown: shutdown.subscribe(),
            };
            tasks.spawn(worker.run());
        }

        info!(workers = consumers.len(), "Worker pool started");
        Self {
            shutdown,
            tasks,
            consumers,
        }
    }

    pub fn consumers(&self) -> &[String] {
        &self.consumers
    }

    /// A detached handle that stops dequeuing without owning the pool.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.shutdown.clone())
    }

    /// Stop dequeuing. In-flight jobs keep running until settled.
    pub fn shutdown(&self) {
        self.stop_handle().stop();
    }

    /// Wait for every worker to exit. No forced timeout.
    pub async fn join(mut self) -> WorkerResult<()> {
        let mut panicked = 0;
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    panicked += 1;
                    error!("Worker task panicked: {}", e);
                }
            }
        }

        info!("Worker pool stopped");
        if panicked > 0 {
            Err(WorkerError::WorkerPanicked(panicked))
        } else {
            Ok(())
        }
    }
}

/// Stops a [`WorkerPool`] from dequeuing; cheap to clone and move into
/// signal handling.
#[derive(Clone)]
pub struct StopHandle(watch::Sender<bool>);

impl StopHandle {
    pub fn stop(&self) {
        if !self.0.send_replace(true) {
            info!("Worker pool shutdown requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }
}

struct Worker {
    consumer: String,
    ctx: WorkerContext,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        debug!(consumer = %self.consumer, "Worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // Dequeue is cancellation-safe: an entry handed out but never
            // processed is redelivered after the visibility timeout.
            let next = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                next = self.ctx.queue.dequeue(&self.consumer, self.config.poll_block) => next,
            };

            match next {
                Ok(Some(delivery)) => self.process(delivery).await,
                Ok(None) => {}
                Err(QueueError::Closed) => {
                    info!(consumer = %self.consumer, "Queue closed, worker exiting");
                    break;
                }
                Err(e) => {
                    record_queue_error("dequeue");
                    warn!(consumer = %self.consumer, "Dequeue failed: {}", e);
                    tokio::select! {
                        biased;
                        _ = self.shutdown.changed() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        debug!(consumer = %self.consumer, "Worker stopped");
    }

    async fn process(&self, delivery: Delivery) {
        let logger = JobLogger::new(delivery.job_id(), "reel_download");
        let span = logger.create_span(&self.consumer);

        async {
            job_started();
            let _in_flight = scopeguard::guard((), |_| job_finished());
            let started = Instant::now();

            logger.log_start(&delivery.job.source_url);

            let heartbeat = spawn_heartbeat(
                Arc::clone(&self.ctx.queue),
                delivery.clone(),
                self.config.heartbeat_interval,
            );
            let heartbeat = scopeguard::guard(heartbeat, |handle| handle.abort());

            let result = self
                .ctx
                .cascade
                .run(delivery.job_id().as_str(), &delivery.job.source_url)
                .await;
            drop(heartbeat);

            let (outcome, settled) = match result {
                Ok(artifact) => self.settle_success(&logger, &delivery, artifact).await,
                Err(err) => {
                    let history = err.attempts().to_vec();
                    let failure = if err.is_terminal() {
                        JobFailure::terminal(err.to_string(), history)
                    } else {
                        JobFailure::retryable(err.to_string(), history)
                    };
                    self.settle_failure(&logger, &delivery, failure).await
                }
            };

            record_job(outcome, started.elapsed().as_secs_f64());

            if let Some(job) = settled {
                self.finish(&logger, &job).await;
            }
        }
        .instrument(span)
        .await
    }

    async fn settle_success(
        &self,
        logger: &JobLogger,
        delivery: &Delivery,
        artifact: reel_models::DownloadArtifact,
    ) -> (&'static str, Option<Job>) {
        let method = artifact.method;
        match self.ctx.queue.ack(delivery, artifact).await {
            Ok(job) => {
                logger.log_completion(&format!("downloaded via {}", method));
                ("succeeded", Some(job))
            }
            Err(QueueError::LeaseLost(_)) => {
                logger.log_warning("lease lost before ack, another worker owns the job");
                ("lease_lost", None)
            }
            Err(e) => {
                record_queue_error("ack");
                logger.log_error(&format!("failed to ack: {}", e));
                ("settle_error", None)
            }
        }
    }

    async fn settle_failure(
        &self,
        logger: &JobLogger,
        delivery: &Delivery,
        failure: JobFailure,
    ) -> (&'static str, Option<Job>) {
        let message = failure.message.clone();
        match self.ctx.queue.nack(delivery, failure).await {
            Ok(NackDisposition::Retry { attempt, delay }) => {
                logger.log_warning(&format!(
                    "attempt {} failed, retrying in {}ms: {}",
                    attempt,
                    delay.as_millis(),
                    message
                ));
                ("retried", None)
            }
            Ok(NackDisposition::Failed { job }) => {
                logger.log_error(&format!("failed after {} attempt(s): {}", job.attempts, message));
                ("failed", Some(job))
            }
            Err(QueueError::LeaseLost(_)) => {
                logger.log_warning("lease lost before nack, another worker owns the job");
                ("lease_lost", None)
            }
            Err(e) => {
                record_queue_error("nack");
                logger.log_error(&format!("failed to nack: {}", e));
                ("settle_error", None)
            }
        }
    }

    /// Post-settle side effects. None of these can change the job outcome.
    async fn finish(&self, logger: &JobLogger, job: &Job) {
        if let Err(e) = self.ctx.store.save(job).await {
            logger.log_warning(&format!("failed to persist job record: {}", e));
        }

        if let Err(e) = self.ctx.notifier.notify(&CompletionEvent::from(job)).await {
            logger.log_warning(&format!("completion notification failed: {}", e));
        }

        if !self.config.retain_artifacts {
            if let Some(artifact) = &job.artifact {
                match tokio::fs::remove_file(&artifact.path).await {
                    Ok(()) => logger.log_progress("artifact removed"),
                    Err(e) => logger.log_warning(&format!("failed to remove artifact: {}", e)),
                }
            }
        }
    }
}

/// Extend the delivery's lease every `interval` until aborted.
fn spawn_heartbeat(
    queue: Arc<dyn JobQueue>,
    delivery: Delivery,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match queue.heartbeat(&delivery).await {
                Ok(()) => debug!(job_id = %delivery.job_id(), "Lease extended"),
                Err(QueueError::LeaseLost(_)) | Err(QueueError::Closed) => {
                    warn!(job_id = %delivery.job_id(), "Stopped heartbeat, lease no longer held");
                    break;
                }
                Err(e) => {
                    record_queue_error("heartbeat");
                    warn!(job_id = %delivery.job_id(), "Heartbeat failed: {}", e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::NoopNotifier;
    use async_trait::async_trait;
    use mockall::mock;
    use reel_downloader::{DownloadError, DownloadRequest, DownloadResult, DownloadStrategy};
    use reel_models::{DownloadMethod, JobId, JobStatus};
    use reel_queue::{BackoffPolicy, MemoryJobQueue};
    use reel_store::{JobRecord, MemoryJobStore, StoreError, StoreResult};
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    mock! {
        pub Store {}

        #[async_trait]
        impl JobRecordStore for Store {
            async fn save(&self, job: &Job) -> StoreResult<()>;
            async fn load(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>>;
            async fn health_check(&self) -> StoreResult<()>;
            async fn close(&self) -> StoreResult<()>;
        }
    }

    /// Replays one scripted result per call; optionally waits on a gate.
    struct Scripted {
        results: Mutex<VecDeque<DownloadResult<()>>>,
        started: Arc<Notify>,
        gate: Option<Arc<Notify>>,
    }

    impl Scripted {
        fn new(results: Vec<DownloadResult<()>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                started: Arc::new(Notify::new()),
                gate: None,
            }
        }
    }

    #[async_trait]
    impl DownloadStrategy for Scripted {
        fn method(&self) -> DownloadMethod {
            DownloadMethod::ProxyConversion
        }

        async fn attempt(&self, request: &DownloadRequest) -> DownloadResult<PathBuf> {
            self.started.notify_one();
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let next = self
                .results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(DownloadError::failed("no scripted result")));
            next?;
            std::fs::write(&request.output_path, b"reel")?;
            Ok(request.output_path.clone())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<CompletionEvent>>,
    }

    #[async_trait]
    impl CompletionNotifier for Recorder {
        async fn notify(&self, event: &CompletionEvent) -> WorkerResult<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn queue() -> Arc<MemoryJobQueue> {
        Arc::new(MemoryJobQueue::new(
            Duration::from_secs(30),
            BackoffPolicy {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                max_attempts: 3,
            },
        ))
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 1,
            poll_block: Duration::from_millis(20),
            error_backoff: Duration::from_millis(10),
            ..WorkerConfig::default()
        }
    }

    fn context(
        dir: &TempDir,
        queue: Arc<MemoryJobQueue>,
        strategy: Arc<Scripted>,
        store: Arc<dyn JobRecordStore>,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> WorkerContext {
        WorkerContext {
            queue,
            cascade: Arc::new(Cascade::new(dir.path(), vec![strategy as Arc<dyn DownloadStrategy>])),
            store,
            notifier,
        }
    }

    async fn wait_for_status(queue: &MemoryJobQueue, id: &JobId, status: JobStatus) -> Job {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(job) = queue.get(id).await.unwrap() {
                    if job.status == status {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job did not reach expected status")
    }

    #[tokio::test]
    async fn test_stop_handle_suspends_dequeue_before_join() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        let strategy = Arc::new(Scripted::new(vec![Ok(())]));

        let pool = WorkerPool::start(
            context(
                &dir,
                queue.clone(),
                strategy,
                Arc::new(MemoryJobStore::new()),
                Arc::new(NoopNotifier),
            ),
            config(),
        );
        let stop = pool.stop_handle();
        stop.stop();
        assert!(stop.is_stopped());

        // The pool is still alive but must not pick anything up
        let id = queue.enqueue(Job::new("https://www.instagram.com/reel/b/")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(queue.get(&id).await.unwrap().unwrap().status, JobStatus::Queued);

        pool.join().await.unwrap();
        assert_eq!(queue.get(&id).await.unwrap().unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_successful_job_is_acked_persisted_and_notified() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        let store = Arc::new(MemoryJobStore::new());
        let recorder = Arc::new(Recorder::default());
        let strategy = Arc::new(Scripted::new(vec![Ok(())]));

        let pool = WorkerPool::start(
            context(&dir, queue.clone(), strategy, store.clone(), recorder.clone()),
            config(),
        );
        let id = queue.enqueue(Job::new("https://www.instagram.com/reel/a/")).await.unwrap();

        let job = wait_for_status(&queue, &id, JobStatus::Succeeded).await;
        assert_eq!(job.method, Some(DownloadMethod::ProxyConversion));

        pool.shutdown();
        pool.join().await.unwrap();

        let record = store.load(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Succeeded);
        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_terminal_failure_skips_retries() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        let store = Arc::new(MemoryJobStore::new());
        let strategy = Arc::new(Scripted::new(vec![Err(DownloadError::DurationExceeded {
            max_secs: 300,
            actual_secs: Some(600),
        })]));

        let pool = WorkerPool::start(
            context(&dir, queue.clone(), strategy, store.clone(), Arc::new(NoopNotifier)),
            config(),
        );
        let id = queue.enqueue(Job::new("https://www.instagram.com/reel/b/")).await.unwrap();

        let job = wait_for_status(&queue, &id, JobStatus::Failed).await;
        assert_eq!(job.attempts, 1);
        assert!(job.error.unwrap().contains("duration"));

        pool.shutdown();
        pool.join().await.unwrap();
        assert_eq!(queue.stats().await.unwrap().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_by_the_queue() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        let store = Arc::new(MemoryJobStore::new());
        let strategy = Arc::new(Scripted::new(vec![
            Err(DownloadError::RateLimited("429".into())),
            Ok(()),
        ]));

        let pool = WorkerPool::start(
            context(&dir, queue.clone(), strategy, store, Arc::new(NoopNotifier)),
            config(),
        );
        let id = queue.enqueue(Job::new("https://www.instagram.com/reel/c/")).await.unwrap();

        let job = wait_for_status(&queue, &id, JobStatus::Succeeded).await;
        assert_eq!(job.attempts, 1);

        pool.shutdown();
        pool.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_store_failure_does_not_change_outcome() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        let mut store = MockStore::new();
        store
            .expect_save()
            .times(1)
            .returning(|_| Err(StoreError::Unavailable("store down".into())));
        let recorder = Arc::new(Recorder::default());
        let strategy = Arc::new(Scripted::new(vec![Ok(())]));

        let pool = WorkerPool::start(
            context(&dir, queue.clone(), strategy, Arc::new(store), recorder.clone()),
            config(),
        );
        let id = queue.enqueue(Job::new("https://www.instagram.com/reel/d/")).await.unwrap();

        wait_for_status(&queue, &id, JobStatus::Succeeded).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.events.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        pool.shutdown();
        pool.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_job_and_stops_dequeuing() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        let gate = Arc::new(Notify::new());
        let mut scripted = Scripted::new(vec![Ok(()), Ok(())]);
        scripted.gate = Some(gate.clone());
        let started = scripted.started.clone();
        let strategy = Arc::new(scripted);

        let pool = WorkerPool::start(
            context(&dir, queue.clone(), strategy, Arc::new(MemoryJobStore::new()), Arc::new(NoopNotifier)),
            config(),
        );
        let first = queue.enqueue(Job::new("https://www.instagram.com/reel/e/")).await.unwrap();
        started.notified().await;

        pool.shutdown();
        let second = queue.enqueue(Job::new("https://www.instagram.com/reel/f/")).await.unwrap();

        let mut join = tokio::spawn(pool.join());
        assert!(
            tokio::time::timeout(Duration::from_millis(100), &mut join).await.is_err(),
            "pool exited while a job was in flight"
        );

        gate.notify_one();
        join.await.unwrap().unwrap();

        assert_eq!(
            queue.get(&first).await.unwrap().unwrap().status,
            JobStatus::Succeeded
        );
        assert_eq!(
            queue.get(&second).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_artifacts_removed_when_not_retained() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        let strategy = Arc::new(Scripted::new(vec![Ok(())]));
        let config = WorkerConfig {
            retain_artifacts: false,
            ..config()
        };
        let recorder = Arc::new(Recorder::default());

        let pool = WorkerPool::start(
            context(&dir, queue.clone(), strategy, Arc::new(MemoryJobStore::new()), recorder.clone()),
            config,
        );
        let id = queue.enqueue(Job::new("https://www.instagram.com/reel/g/")).await.unwrap();

        let job = wait_for_status(&queue, &id, JobStatus::Succeeded).await;
        pool.shutdown();
        pool.join().await.unwrap();

        let path = job.artifact.unwrap().path;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_workers_exit_when_queue_closes() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        let strategy = Arc::new(Scripted::new(vec![]));

        let pool = WorkerPool::start(
            context(&dir, queue.clone(), strategy, Arc::new(MemoryJobStore::new()), Arc::new(NoopNotifier)),
            WorkerConfig {
                concurrency: 3,
                ..config()
            },
        );
        assert_eq!(pool.consumers().len(), 3);

        queue.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .unwrap()
            .unwrap();
    }
}
