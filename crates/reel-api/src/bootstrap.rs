//! Startup and drain of every collaborator.
//!
//! Each startup step advances the lifecycle; a failure aborts startup and
//! the caller exits non-zero. Drain releases resources in the mirror image
//! of acquisition order.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};

use reel_downloader::{Cascade, DownloaderConfig, SessionCookie};
use reel_queue::{JobQueue, MemoryJobQueue, QueueBackend, QueueConfig, RedisJobQueue};
use reel_store::{
    FirestoreJobStore, JobRecordStore, MemoryJobStore, StoreBackend, StoreClient, StoreConfig,
};
use reel_worker::{notifier_from_config, StopHandle, WorkerConfig, WorkerContext, WorkerPool};

use crate::admission::Admission;
use crate::broker::Broker;
use crate::config::{AdmissionConfig, ApiConfig};
use crate::lifecycle::{DrainReason, Lifecycle, LifecycleState};
use crate::state::AppState;

/// Everything the process owns once startup completes.
pub struct AppContext {
    pub state: AppState,
    pub workers: WorkerPool,
}

impl AppContext {
    /// Handle that starts a drain while the listener is still finishing
    /// requests.
    pub fn drain_trigger(&self) -> DrainTrigger {
        DrainTrigger {
            lifecycle: self.state.lifecycle.clone(),
            workers: self.workers.stop_handle(),
        }
    }
}

/// First half of a drain: flip readiness and suspend dequeues at once.
///
/// [`drain`] performs the rest after the listener has stopped.
#[derive(Clone)]
pub struct DrainTrigger {
    lifecycle: Lifecycle,
    workers: StopHandle,
}

impl DrainTrigger {
    pub fn fire(&self) {
        self.lifecycle.begin_drain();
        self.workers.stop();
    }
}

/// Acquire collaborators in order:
/// store, broker, admission, queue, workers.
///
/// The HTTP listener is bound by the caller, which then advances the
/// lifecycle to `listening`.
pub async fn bootstrap(
    api: ApiConfig,
    admission: AdmissionConfig,
    lifecycle: Lifecycle,
) -> anyhow::Result<AppContext> {
    // On-disk layout comes first: the cascade and cookie artifact need it
    let downloader = DownloaderConfig::from_env();
    tokio::fs::create_dir_all(&downloader.temp_dir)
        .await
        .with_context(|| format!("creating temp dir {}", downloader.temp_dir.display()))?;

    match std::env::var("SESSION_COOKIE").ok().filter(|s| !s.trim().is_empty()) {
        Some(payload) => SessionCookie::new(&downloader.cookie_path)
            .materialize(&payload)
            .await
            .context("writing session cookie artifact")?,
        None => info!("SESSION_COOKIE not set, authenticated downloads disabled"),
    }

    // Store
    let store_config = StoreConfig::from_env().context("loading store config")?;
    let store: Arc<dyn JobRecordStore> = match store_config.backend {
        StoreBackend::Firestore => {
            let client = StoreClient::new(store_config)
                .await
                .context("creating store client")?;
            Arc::new(FirestoreJobStore::new(client))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory job store, records do not survive restarts");
            Arc::new(MemoryJobStore::new())
        }
    };
    store.health_check().await.context("store health check")?;
    lifecycle.advance(LifecycleState::StoreConnected)?;

    // Broker
    let queue_config = QueueConfig::from_env();
    let broker = match queue_config.backend {
        QueueBackend::Redis => {
            let broker = Broker::connect(&queue_config.redis_url)
                .await
                .context("connecting to broker")?;
            info!(url = %broker.url(), "Broker connected");
            Some(Arc::new(broker))
        }
        QueueBackend::Memory => {
            info!("No broker configured, rate limiting stays process-local");
            None
        }
    };
    lifecycle.advance(LifecycleState::BrokerConnected)?;

    // Admission
    let admission = Arc::new(Admission::new(admission, broker.clone()));
    lifecycle.advance(LifecycleState::AdmissionReady)?;

    // Queue
    let visibility_timeout = queue_config.visibility_timeout;
    let queue: Arc<dyn JobQueue> = match queue_config.backend {
        QueueBackend::Redis => Arc::new(
            RedisJobQueue::connect(queue_config)
                .await
                .context("connecting job queue")?,
        ),
        QueueBackend::Memory => {
            warn!("Using in-memory job queue, jobs do not survive restarts");
            Arc::new(MemoryJobQueue::from_config(&queue_config))
        }
    };
    queue.init().await.context("initializing job queue")?;
    lifecycle.advance(LifecycleState::QueueReady)?;

    // Workers
    let worker_config = WorkerConfig::from_env().fitted_to_visibility(visibility_timeout);
    let cascade = Cascade::from_config(&downloader).context("building download cascade")?;
    let notifier = notifier_from_config(&worker_config).context("building completion notifier")?;
    let workers = WorkerPool::start(
        WorkerContext {
            queue: Arc::clone(&queue),
            cascade: Arc::new(cascade),
            store: Arc::clone(&store),
            notifier,
        },
        worker_config,
    );
    lifecycle.advance(LifecycleState::WorkersRunning)?;

    let state = AppState {
        config: api,
        queue,
        store,
        broker,
        admission,
        lifecycle,
    };

    Ok(AppContext { state, workers })
}

/// How a startup raced against the drain trigger ended.
pub enum Startup {
    Ready(AppContext),
    Failed(anyhow::Error),
    /// A drain was requested before startup finished.
    Interrupted(DrainReason),
}

/// Run `startup` unless a drain is requested first.
///
/// On interruption the startup future is dropped, releasing whatever it had
/// acquired, and the lifecycle goes straight to `terminated`.
pub async fn start_or_interrupt<F>(
    startup: F,
    lifecycle: &Lifecycle,
    reasons: &mut watch::Receiver<Option<DrainReason>>,
) -> Startup
where
    F: Future<Output = anyhow::Result<AppContext>>,
{
    let requested = async { reasons.wait_for(Option::is_some).await.map(|r| r.clone()) };
    tokio::select! {
        result = startup => match result {
            Ok(ctx) => Startup::Ready(ctx),
            Err(e) => Startup::Failed(e),
        },
        Ok(Some(reason)) = requested => {
            warn!(state = %lifecycle.state(), reason = %reason, "Drain requested during startup");
            lifecycle.begin_drain();
            if let Err(e) = lifecycle.advance(LifecycleState::Terminated) {
                error!("{}", e);
            }
            Startup::Interrupted(reason)
        }
    }
}

/// Release everything in reverse acquisition order.
///
/// The listener must already be stopped. Workers finish their in-flight
/// jobs before the queue closes. Every step runs even if an earlier one
/// fails; the first failure is returned.
pub async fn drain(ctx: AppContext, reason: DrainReason) -> anyhow::Result<()> {
    let AppContext { state, workers } = ctx;
    state.lifecycle.begin_drain();
    info!(reason = %reason, "Draining");

    let mut first_error: Option<anyhow::Error> = None;
    let mut record = |step: &str, result: anyhow::Result<()>| {
        if let Err(e) = result {
            error!(step, error = %e, "Drain step failed");
            first_error.get_or_insert(e);
        }
    };

    workers.shutdown();
    record("workers", workers.join().await.map_err(Into::into));

    record("queue", state.queue.close().await.map_err(Into::into));

    if let Some(broker) = &state.broker {
        broker.close().await;
    }

    record("store", state.store.close().await.map_err(Into::into));

    state.lifecycle.advance(LifecycleState::Terminated)?;
    info!("Drain complete");

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_downloader::Cascade;
    use reel_models::Job;
    use reel_worker::NoopNotifier;

    async fn in_memory_context() -> AppContext {
        let state = AppState::in_memory(ApiConfig::default(), AdmissionConfig::default());
        for step in [
            LifecycleState::StoreConnected,
            LifecycleState::BrokerConnected,
            LifecycleState::AdmissionReady,
            LifecycleState::QueueReady,
        ] {
            state.lifecycle.advance(step).unwrap();
        }
        state.queue.init().await.unwrap();

        let temp = tempfile::tempdir().unwrap();
        let workers = WorkerPool::start(
            WorkerContext {
                queue: Arc::clone(&state.queue),
                cascade: Arc::new(Cascade::new(temp.path(), Vec::new())),
                store: Arc::clone(&state.store),
                notifier: Arc::new(NoopNotifier),
            },
            WorkerConfig::default(),
        );
        state.lifecycle.advance(LifecycleState::WorkersRunning).unwrap();
        state.lifecycle.advance(LifecycleState::Listening).unwrap();

        AppContext { state, workers }
    }

    #[tokio::test]
    async fn test_drain_reaches_terminated_and_closes_queue() {
        let ctx = in_memory_context().await;
        let state = ctx.state.clone();
        let mut watcher = state.lifecycle.subscribe();

        drain(ctx, DrainReason::Signal("SIGTERM")).await.unwrap();

        assert_eq!(state.lifecycle.state(), LifecycleState::Terminated);
        assert!(watcher.has_changed().unwrap());
        assert!(state.queue.enqueue(Job::new("https://www.tiktok.com/@a/video/1")).await.is_err());
        assert!(state.store.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_drain_trigger_stops_dequeue_before_drain() {
        let ctx = in_memory_context().await;
        ctx.drain_trigger().fire();
        assert_eq!(ctx.state.lifecycle.state(), LifecycleState::Draining);

        // Workers are still joinable but no longer pick up work
        let id = ctx
            .state
            .queue
            .enqueue(Job::new("https://www.instagram.com/reel/late/"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let job = ctx.state.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, reel_models::JobStatus::Queued);

        let lifecycle = ctx.state.lifecycle.clone();
        drain(ctx, DrainReason::Signal("SIGTERM")).await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_signal_during_startup_interrupts_it() {
        let lifecycle = Lifecycle::new();
        lifecycle.advance(LifecycleState::StoreConnected).unwrap();
        let (tx, mut rx) = watch::channel(None);

        let stuck = std::future::pending::<anyhow::Result<AppContext>>();
        let raced = tokio::spawn({
            let lifecycle = lifecycle.clone();
            async move { start_or_interrupt(stuck, &lifecycle, &mut rx).await }
        });
        tx.send(Some(DrainReason::Signal("SIGTERM"))).unwrap();

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(1), raced)
            .await
            .expect("startup was not interrupted")
            .unwrap();
        assert!(matches!(outcome, Startup::Interrupted(DrainReason::Signal("SIGTERM"))));
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_startup_failure_is_reported() {
        let lifecycle = Lifecycle::new();
        let (_tx, mut rx) = watch::channel(None);

        let outcome = start_or_interrupt(
            async { Err(anyhow::anyhow!("store unreachable")) },
            &lifecycle,
            &mut rx,
        )
        .await;
        assert!(matches!(outcome, Startup::Failed(_)));
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);
    }

    #[tokio::test]
    async fn test_drain_can_only_run_once() {
        let ctx = in_memory_context().await;
        let lifecycle = ctx.state.lifecycle.clone();
        drain(ctx, DrainReason::Panic("boom".to_string())).await.unwrap();

        assert!(!lifecycle.begin_drain());
        assert!(lifecycle.advance(LifecycleState::Terminated).is_err());
    }
}
