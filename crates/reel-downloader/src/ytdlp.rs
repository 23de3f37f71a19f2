//! Direct fetch through yt-dlp.
//!
//! Used twice in the cascade: first with the session cookie (authenticated
//! direct fetch), last without it (unauthenticated direct fetch). yt-dlp
//! enforces the duration and size limits itself, and reports refusals on its
//! output rather than through the exit status, so both streams are
//! classified.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reel_models::DownloadMethod;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::DownloaderConfig;
use crate::cookie::SessionCookie;
use crate::error::{DownloadError, DownloadResult};
use crate::strategy::{DownloadRequest, DownloadStrategy};

/// yt-dlp strategy, with or without a cookie file.
#[derive(Debug, Clone)]
pub struct YtDlpStrategy {
    binary: String,
    cookie: Option<SessionCookie>,
    max_duration_secs: u64,
    max_filesize_bytes: u64,
    timeout: Duration,
}

impl YtDlpStrategy {
    /// Strategy A: authenticate with the session cookie artifact.
    pub fn authenticated(config: &DownloaderConfig) -> Self {
        Self {
            cookie: Some(SessionCookie::new(&config.cookie_path)),
            ..Self::unauthenticated(config)
        }
    }

    /// Strategy C: no credentials.
    pub fn unauthenticated(config: &DownloaderConfig) -> Self {
        Self {
            binary: config.ytdlp_binary.clone(),
            cookie: None,
            max_duration_secs: config.max_duration_secs,
            max_filesize_bytes: config.max_filesize_bytes,
            timeout: config.timeout,
        }
    }

    fn args(&self, request: &DownloadRequest) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-progress".to_string(),
            "--no-part".to_string(),
            // `<=?` lets entries without a known duration through
            "--match-filter".to_string(),
            format!("duration <=? {}", self.max_duration_secs),
            "--max-filesize".to_string(),
            self.max_filesize_bytes.to_string(),
            "-f".to_string(),
            "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best".to_string(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "-o".to_string(),
            request.output_path.to_string_lossy().into_owned(),
        ];

        if let Some(cookie) = &self.cookie {
            args.push("--cookies".to_string());
            args.push(cookie.path().to_string_lossy().into_owned());
        }

        // Keeps a URL starting with '-' from being read as an option
        args.push("--".to_string());
        args.push(request.source_url.clone());
        args
    }
}

#[async_trait]
impl DownloadStrategy for YtDlpStrategy {
    fn method(&self) -> DownloadMethod {
        if self.cookie.is_some() {
            DownloadMethod::AuthenticatedDirect
        } else {
            DownloadMethod::UnauthenticatedDirect
        }
    }

    async fn is_available(&self) -> bool {
        match &self.cookie {
            Some(cookie) => cookie.is_usable().await,
            None => true,
        }
    }

    async fn attempt(&self, request: &DownloadRequest) -> DownloadResult<PathBuf> {
        info!(
            job_id = %request.job_id,
            strategy = %self.method(),
            "Downloading with yt-dlp"
        );

        let child = Command::new(&self.binary)
            .args(self.args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Err(_) => return Err(DownloadError::Timeout(self.timeout.as_secs())),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::ToolMissing(self.binary.clone()))
            }
            Ok(Err(e)) => return Err(DownloadError::Io(e)),
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{}\n{}", stdout, stderr);

        if !output.status.success() {
            debug!(job_id = %request.job_id, "yt-dlp stderr: {}", stderr);
            return Err(classify_output(
                &combined,
                self.max_duration_secs,
                self.max_filesize_bytes,
            ));
        }

        if !file_written(&request.output_path).await {
            // Filter refusals exit 0 without producing a file
            return Err(match classify_output(
                &combined,
                self.max_duration_secs,
                self.max_filesize_bytes,
            ) {
                DownloadError::Failed(_) => DownloadError::failed("yt-dlp produced no output file"),
                other => other,
            });
        }

        Ok(request.output_path.clone())
    }
}

async fn file_written(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.len() > 0)
}

/// Map yt-dlp output to an error kind.
pub fn classify_output(output: &str, max_duration_secs: u64, max_filesize_bytes: u64) -> DownloadError {
    let lower = output.to_ascii_lowercase();

    if lower.contains("does not pass filter") {
        return DownloadError::DurationExceeded {
            max_secs: max_duration_secs,
            actual_secs: None,
        };
    }

    if lower.contains("larger than max-filesize") {
        return DownloadError::FileTooLarge {
            max_bytes: max_filesize_bytes,
        };
    }

    let message = last_error_line(output);

    if lower.contains("429") || lower.contains("too many requests") || lower.contains("rate-limit")
        || lower.contains("rate limit")
    {
        return DownloadError::RateLimited(message);
    }

    if lower.contains("login required")
        || lower.contains("log in")
        || lower.contains("sign in")
        || lower.contains("cookies")
        || lower.contains("private")
        || lower.contains("401")
    {
        return DownloadError::AuthRequired(message);
    }

    if lower.contains("unavailable")
        || lower.contains("not available")
        || lower.contains("404")
        || lower.contains("not found")
        || lower.contains("has been removed")
    {
        return DownloadError::Unavailable(message);
    }

    DownloadError::Failed(message)
}

fn last_error_line(output: &str) -> String {
    let lines: Vec<&str> = output.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    lines
        .iter()
        .rev()
        .find(|l| l.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(|l| l.to_string())
        .unwrap_or_else(|| "Unknown error".to_string())
}
