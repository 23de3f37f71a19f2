//! Completion notifications.
//!
//! Fired once per job when it reaches a terminal status. Delivery is
//! best-effort: the job outcome is already settled in the queue and store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reel_models::{DownloadMethod, Job, JobId, JobStatus};
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};

/// Payload describing a finished job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionEvent {
    pub job_id: JobId,
    pub source_url: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub method: Option<DownloadMethod>,
    pub error: Option<String>,
    pub artifact_path: Option<String>,
    pub size_bytes: Option<u64>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Job> for CompletionEvent {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            source_url: job.source_url.clone(),
            status: job.status,
            attempts: job.attempts,
            method: job.method,
            error: job.error.clone(),
            artifact_path: job
                .artifact
                .as_ref()
                .map(|a| a.path.to_string_lossy().into_owned()),
            size_bytes: job.artifact.as_ref().map(|a| a.size_bytes),
            finished_at: job.finished_at,
        }
    }
}

#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify(&self, event: &CompletionEvent) -> WorkerResult<()>;
}

/// Discards events.
pub struct NoopNotifier;

#[async_trait]
impl CompletionNotifier for NoopNotifier {
    async fn notify(&self, event: &CompletionEvent) -> WorkerResult<()> {
        debug!(job_id = %event.job_id, "No completion notifier configured");
        Ok(())
    }
}

/// POSTs the event as JSON to a fixed URL.
pub struct WebhookNotifier {
    http: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> WorkerResult<Self> {
        let url = url.into();
        reqwest::Url::parse(&url)
            .map_err(|e| WorkerError::config_error(format!("invalid webhook URL: {}", e)))?;

        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("reel-worker/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { http, url })
    }
}

#[async_trait]
impl CompletionNotifier for WebhookNotifier {
    async fn notify(&self, event: &CompletionEvent) -> WorkerResult<()> {
        let response = self.http.post(&self.url).json(event).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(WorkerError::notify_failed(format!(
                "webhook returned {}",
                status.as_u16()
            )));
        }

        debug!(job_id = %event.job_id, "Completion webhook delivered");
        Ok(())
    }
}

/// Webhook notifier when a URL is configured, otherwise a no-op.
pub fn notifier_from_config(config: &WorkerConfig) -> WorkerResult<Arc<dyn CompletionNotifier>> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(url, config.webhook_timeout)?)),
        None => Ok(Arc::new(NoopNotifier)),
    }
}
