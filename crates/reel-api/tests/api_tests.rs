//! End-to-end tests over the in-process queue and store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use reel_api::{create_router, drain, AdmissionConfig, ApiConfig, AppContext, AppState, DrainReason, LifecycleState};
use reel_downloader::{Cascade, DownloadError, DownloadRequest, DownloadResult, DownloadStrategy};
use reel_models::{DownloadMethod, Job, JobId, JobStatus};
use reel_store::{JobRecord, JobRecordStore, MemoryJobStore, StoreResult};
use reel_worker::{NoopNotifier, WorkerConfig, WorkerContext, WorkerPool};

/// Writes a fixed payload, or fails terminally when asked to.
struct FakeStrategy {
    fail: bool,
}

#[async_trait]
impl DownloadStrategy for FakeStrategy {
    fn method(&self) -> DownloadMethod {
        DownloadMethod::ProxyConversion
    }

    async fn attempt(&self, request: &DownloadRequest) -> DownloadResult<PathBuf> {
        if self.fail {
            return Err(DownloadError::FileTooLarge { max_bytes: 1 });
        }
        tokio::fs::write(&request.output_path, b"fake mp4 payload").await?;
        Ok(request.output_path.clone())
    }
}

/// Holds every `queued` write back, as a slow document store would.
struct SlowQueuedWrites {
    inner: MemoryJobStore,
    delay: Duration,
}

#[async_trait]
impl JobRecordStore for SlowQueuedWrites {
    async fn save(&self, job: &Job) -> StoreResult<()> {
        if job.status == JobStatus::Queued {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.save(job).await
    }

    async fn load(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>> {
        self.inner.load(job_id).await
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.inner.health_check().await
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.close().await
    }
}

fn start(fail: bool, temp: &tempfile::TempDir) -> (AppContext, Router) {
    start_with_store(fail, temp, Arc::new(MemoryJobStore::new()))
}

fn start_with_store(
    fail: bool,
    temp: &tempfile::TempDir,
    store: Arc<dyn JobRecordStore>,
) -> (AppContext, Router) {
    let mut state = AppState::in_memory(ApiConfig::default(), AdmissionConfig::default());
    state.store = store;
    for step in [
        LifecycleState::StoreConnected,
        LifecycleState::BrokerConnected,
        LifecycleState::AdmissionReady,
        LifecycleState::QueueReady,
    ] {
        state.lifecycle.advance(step).unwrap();
    }

    let workers = WorkerPool::start(
        WorkerContext {
            queue: Arc::clone(&state.queue),
            cascade: Arc::new(Cascade::new(
                temp.path(),
                vec![Arc::new(FakeStrategy { fail }) as Arc<dyn DownloadStrategy>],
            )),
            store: Arc::clone(&state.store),
            notifier: Arc::new(NoopNotifier),
        },
        WorkerConfig {
            concurrency: 1,
            poll_block: Duration::from_millis(50),
            ..WorkerConfig::default()
        },
    );
    state.lifecycle.advance(LifecycleState::WorkersRunning).unwrap();
    state.lifecycle.advance(LifecycleState::Listening).unwrap();

    let app = create_router(state.clone(), None);
    (AppContext { state, workers }, app)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn enqueue(app: &Router, url: &str) -> String {
    let request = Request::builder()
        .method("POST")
        .uri("/api/jobs")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "url": url }).to_string()))
        .unwrap();
    let (status, body) = send(app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    body["job_id"].as_str().unwrap().to_string()
}

async fn wait_for_terminal(app: &Router, job_id: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let request = Request::builder()
                .uri(format!("/api/jobs/{}", job_id))
                .body(Body::empty())
                .unwrap();
            let (status, body) = send(app, request).await;
            assert_eq!(status, StatusCode::OK);
            if matches!(body["status"].as_str(), Some("succeeded" | "failed")) {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job did not settle in time")
}

#[tokio::test]
async fn test_health_endpoint() {
    let temp = tempfile::tempdir().unwrap();
    let (ctx, app) = start(false, &temp);

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let request = Request::builder().uri("/ready").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");

    drain(ctx, DrainReason::Signal("SIGTERM")).await.unwrap();
}

#[tokio::test]
async fn test_job_runs_to_success() {
    let temp = tempfile::tempdir().unwrap();
    let (ctx, app) = start(false, &temp);

    let job_id = enqueue(&app, "https://www.instagram.com/reel/C1a2b3c4d5e/").await;
    let body = wait_for_terminal(&app, &job_id).await;

    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["method"], "proxy_conversion");
    assert_eq!(body["size_bytes"], 16);
    assert!(body.get("error").is_none());

    let record = ctx
        .state
        .store
        .load(&JobId::from_string(job_id))
        .await
        .unwrap()
        .expect("record persisted");
    assert_eq!(record.status, JobStatus::Succeeded);

    drain(ctx, DrainReason::Signal("SIGTERM")).await.unwrap();
}

#[tokio::test]
async fn test_slow_queued_write_never_overwrites_terminal_record() {
    let temp = tempfile::tempdir().unwrap();
    let store = Arc::new(SlowQueuedWrites {
        inner: MemoryJobStore::new(),
        delay: Duration::from_millis(300),
    });
    let (ctx, app) = start_with_store(false, &temp, store.clone());

    let job_id = enqueue(&app, "https://www.instagram.com/reel/C1a2b3c4d5e/").await;
    let body = wait_for_terminal(&app, &job_id).await;
    assert_eq!(body["status"], "succeeded");

    let job_id = JobId::from_string(job_id);
    let record = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(record) = store.load(&job_id).await.unwrap() {
                if record.status == JobStatus::Succeeded {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("terminal record persisted");
    assert_eq!(record.method, Some(DownloadMethod::ProxyConversion));

    // Longer than the queued write delay: nothing may roll the record back
    tokio::time::sleep(Duration::from_millis(400)).await;
    let record = store.load(&job_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Succeeded);

    drain(ctx, DrainReason::Signal("SIGTERM")).await.unwrap();
}

#[tokio::test]
async fn test_terminal_download_error_fails_job() {
    let temp = tempfile::tempdir().unwrap();
    let (ctx, app) = start(true, &temp);

    let job_id = enqueue(&app, "https://www.tiktok.com/@someone/video/7300000000000000000").await;
    let body = wait_for_terminal(&app, &job_id).await;

    assert_eq!(body["status"], "failed");
    assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));
    assert_eq!(body["attempts"], 1);

    drain(ctx, DrainReason::Signal("SIGINT")).await.unwrap();
}

#[tokio::test]
async fn test_no_jobs_after_drain() {
    let temp = tempfile::tempdir().unwrap();
    let (ctx, app) = start(false, &temp);
    let lifecycle = ctx.state.lifecycle.clone();

    drain(ctx, DrainReason::Signal("SIGTERM")).await.unwrap();
    assert_eq!(lifecycle.state(), LifecycleState::Terminated);

    let request = Request::builder()
        .method("POST")
        .uri("/api/jobs")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "url": "https://www.instagram.com/reel/C1a2b3c4d5e/" }).to_string(),
        ))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
}
