//! Third-party proxy conversion service.
//!
//! The service resolves a reel page URL to a direct media URL (optionally
//! reporting the duration), which is then streamed to disk under the size
//! cap. It cannot enforce the duration ceiling itself, so a reported
//! duration over the limit is surfaced as a terminal error.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reel_models::DownloadMethod;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::{DownloaderConfig, ProxyConfig};
use crate::error::{DownloadError, DownloadResult};
use crate::strategy::{DownloadRequest, DownloadStrategy};

/// Conversion service response.
#[derive(Debug, Deserialize)]
struct ResolveResponse {
    #[serde(alias = "download_url", alias = "media_url")]
    url: Option<String>,
    /// Seconds
    duration: Option<f64>,
    error: Option<String>,
}

/// Strategy B.
pub struct ProxyStrategy {
    http: Client,
    config: ProxyConfig,
    max_duration_secs: u64,
    max_filesize_bytes: u64,
    timeout: Duration,
}

impl ProxyStrategy {
    pub fn new(config: ProxyConfig, limits: &DownloaderConfig) -> DownloadResult<Self> {
        let http = Client::builder()
            .timeout(limits.timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("reel-downloader/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            config,
            max_duration_secs: limits.max_duration_secs,
            max_filesize_bytes: limits.max_filesize_bytes,
            timeout: limits.timeout,
        })
    }

    /// Build from the downloader config; `None` when no service is configured.
    pub fn from_config(config: &DownloaderConfig) -> DownloadResult<Option<Self>> {
        config
            .proxy
            .clone()
            .map(|proxy| Self::new(proxy, config))
            .transpose()
    }

    fn transport_error(&self, e: reqwest::Error) -> DownloadError {
        if e.is_timeout() {
            DownloadError::Timeout(self.timeout.as_secs())
        } else {
            DownloadError::Http(e)
        }
    }

    async fn resolve(&self, source_url: &str) -> DownloadResult<String> {
        let mut request = self
            .http
            .get(&self.config.api_url)
            .query(&[("url", source_url)]);
        if let Some(key) = &self.config.api_key {
            request = request.header("x-rapidapi-key", key);
        }
        if let Some(host) = &self.config.api_host {
            request = request.header("x-rapidapi-host", host);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let body: ResolveResponse = response
            .json()
            .await
            .map_err(|e| DownloadError::failed(format!("Unreadable conversion response: {}", e)))?;

        if let Some(duration) = body.duration {
            if duration > self.max_duration_secs as f64 {
                return Err(DownloadError::DurationExceeded {
                    max_secs: self.max_duration_secs,
                    actual_secs: Some(duration.ceil() as u64),
                });
            }
        }

        match (body.url, body.error) {
            (Some(url), _) if !url.is_empty() => {
                url::Url::parse(&url)
                    .map_err(|_| DownloadError::failed("Conversion service returned an invalid media URL"))?;
                Ok(url)
            }
            (_, Some(error)) => Err(DownloadError::unavailable(error)),
            _ => Err(DownloadError::unavailable("Conversion service returned no media URL")),
        }
    }

    async fn stream_to_disk(&self, media_url: &str, request: &DownloadRequest) -> DownloadResult<u64> {
        let response = self.http.get(media_url).send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        if response
            .content_length()
            .is_some_and(|len| len > self.max_filesize_bytes)
        {
            return Err(DownloadError::FileTooLarge {
                max_bytes: self.max_filesize_bytes,
            });
        }

        let mut file = tokio::fs::File::create(&request.output_path).await?;
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.transport_error(e))?;
            written += chunk.len() as u64;
            if written > self.max_filesize_bytes {
                drop(file);
                let _ = tokio::fs::remove_file(&request.output_path).await;
                return Err(DownloadError::FileTooLarge {
                    max_bytes: self.max_filesize_bytes,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        if written == 0 {
            return Err(DownloadError::unavailable("Media stream was empty"));
        }
        Ok(written)
    }
}

#[async_trait]
impl DownloadStrategy for ProxyStrategy {
    fn method(&self) -> DownloadMethod {
        DownloadMethod::ProxyConversion
    }

    async fn attempt(&self, request: &DownloadRequest) -> DownloadResult<PathBuf> {
        let media_url = self.resolve(&request.source_url).await?;
        debug!(job_id = %request.job_id, "Conversion service resolved media URL");

        let bytes = self.stream_to_disk(&media_url, request).await?;
        info!(job_id = %request.job_id, bytes, "Proxy download complete");
        Ok(request.output_path.clone())
    }
}

fn status_error(status: StatusCode, body: &str) -> DownloadError {
    let message = format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DownloadError::AuthRequired(message),
        StatusCode::TOO_MANY_REQUESTS => DownloadError::RateLimited(message),
        StatusCode::NOT_FOUND | StatusCode::GONE => DownloadError::Unavailable(message),
        s if s.is_server_error() => DownloadError::Unavailable(message),
        _ => DownloadError::Failed(message),
    }
}
