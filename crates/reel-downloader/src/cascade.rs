//! The fallback cascade.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use reel_models::{AttemptRecord, DownloadArtifact, DownloadMethod};
use tracing::{debug, info, warn};

use crate::config::DownloaderConfig;
use crate::error::{CascadeError, DownloadError, DownloadResult};
use crate::identifier::output_path;
use crate::metrics::{record_attempt, record_bytes};
use crate::proxy::ProxyStrategy;
use crate::strategy::{AttemptOutcome, DownloadRequest, DownloadStrategy};
use crate::ytdlp::YtDlpStrategy;

/// Ordered list of download strategies.
///
/// Strategies run one at a time in the order given; the first success wins
/// and a terminal error stops the run.
#[derive(Clone)]
pub struct Cascade {
    temp_dir: PathBuf,
    strategies: Vec<Arc<dyn DownloadStrategy>>,
}

impl Cascade {
    pub fn new(temp_dir: impl Into<PathBuf>, strategies: Vec<Arc<dyn DownloadStrategy>>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            strategies,
        }
    }

    /// Authenticated direct fetch, then the proxy service (when configured),
    /// then unauthenticated direct fetch.
    pub fn from_config(config: &DownloaderConfig) -> DownloadResult<Self> {
        let mut strategies: Vec<Arc<dyn DownloadStrategy>> =
            vec![Arc::new(YtDlpStrategy::authenticated(config))];

        if let Some(proxy) = ProxyStrategy::from_config(config)? {
            strategies.push(Arc::new(proxy));
        }

        strategies.push(Arc::new(YtDlpStrategy::unauthenticated(config)));

        Ok(Self::new(config.temp_dir.clone(), strategies))
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn methods(&self) -> Vec<DownloadMethod> {
        self.strategies.iter().map(|s| s.method()).collect()
    }

    /// Download `source_url` for `job_id`.
    pub async fn run(&self, job_id: &str, source_url: &str) -> Result<DownloadArtifact, CascadeError> {
        let started = Instant::now();

        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| CascadeError::Setup(DownloadError::Io(e)))?;
        let request = DownloadRequest {
            job_id: job_id.to_string(),
            source_url: source_url.to_string(),
            output_path: output_path(&self.temp_dir, job_id).map_err(CascadeError::Setup)?,
        };

        let mut attempts: Vec<AttemptRecord> = Vec::with_capacity(self.strategies.len());
        let mut last_error: Option<DownloadError> = None;

        for strategy in &self.strategies {
            let method = strategy.method();
            if !strategy.is_available().await {
                debug!(job_id = %job_id, strategy = %method, "Strategy unavailable, skipping");
                continue;
            }

            remove_partial(&request.output_path).await;

            let attempt_started = Instant::now();
            let outcome = AttemptOutcome::classify(strategy.attempt(&request).await);
            let elapsed_ms = attempt_started.elapsed().as_millis() as u64;

            match outcome {
                AttemptOutcome::Success(path) => {
                    record_attempt(method, "success", elapsed_ms);
                    attempts.push(AttemptRecord::success(method, elapsed_ms));

                    let size_bytes = tokio::fs::metadata(&path)
                        .await
                        .map(|m| m.len())
                        .unwrap_or(0);
                    record_bytes(method, size_bytes);

                    info!(
                        job_id = %job_id,
                        strategy = %method,
                        attempts = attempts.len(),
                        size_bytes,
                        "Download succeeded"
                    );

                    return Ok(DownloadArtifact {
                        path,
                        method,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        size_bytes,
                        attempts,
                    });
                }
                AttemptOutcome::Terminal(error) => {
                    record_attempt(method, error.kind(), elapsed_ms);
                    attempts.push(AttemptRecord::failure(method, error.to_string(), elapsed_ms));
                    remove_partial(&request.output_path).await;

                    warn!(
                        job_id = %job_id,
                        strategy = %method,
                        error = %error,
                        "Terminal download error, aborting cascade"
                    );
                    return Err(CascadeError::Terminal {
                        method,
                        source: error,
                        attempts,
                    });
                }
                AttemptOutcome::RetryNext(error) => {
                    record_attempt(method, error.kind(), elapsed_ms);
                    attempts.push(AttemptRecord::failure(method, error.to_string(), elapsed_ms));

                    warn!(
                        job_id = %job_id,
                        strategy = %method,
                        error = %error,
                        "Download strategy failed, trying next"
                    );
                    last_error = Some(error);
                }
            }
        }

        remove_partial(&request.output_path).await;

        Err(CascadeError::Exhausted {
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no download strategy was available".to_string()),
            attempts,
        })
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove partial download: {}", e),
    }
}
