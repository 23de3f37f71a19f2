//! Session cookie artifact for authenticated downloads.
//!
//! The cookie arrives as an environment payload (raw Netscape text or its
//! base64 encoding) and is written once at startup to a fixed path that
//! yt-dlp reads with `--cookies`.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{DownloadError, DownloadResult};

/// A real Netscape cookies file is at least ~50 bytes.
const MIN_COOKIES_FILE_SIZE: u64 = 50;

/// Netscape cookies files either start with a known header or contain
/// tab-separated lines with at least six fields.
pub fn is_valid_netscape_cookies(content: &str) -> bool {
    if content.starts_with("# Netscape HTTP Cookie File") || content.starts_with("# HTTP Cookie File")
    {
        return true;
    }

    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .any(|line| line.split('\t').count() >= 6)
}

/// The on-disk cookie artifact.
#[derive(Debug, Clone)]
pub struct SessionCookie {
    path: PathBuf,
}

impl SessionCookie {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the payload to the artifact path, owner-readable only.
    pub async fn materialize(&self, payload: &str) -> DownloadResult<()> {
        let content = decode_payload(payload)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&self.path).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;

        info!(path = %self.path.display(), "Session cookie artifact written");
        Ok(())
    }

    /// Whether the artifact exists and looks like a usable cookies file.
    pub async fn is_usable(&self) -> bool {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.len() >= MIN_COOKIES_FILE_SIZE => {}
            Ok(meta) => {
                debug!(path = %self.path.display(), size = meta.len(), "Cookie file too small, skipping");
                return false;
            }
            Err(_) => return false,
        }

        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => is_valid_netscape_cookies(&content),
            Err(e) => {
                warn!("Failed to read cookie file: {}", e);
                false
            }
        }
    }
}

fn decode_payload(payload: &str) -> DownloadResult<String> {
    let trimmed = payload.trim();
    if is_valid_netscape_cookies(trimmed) {
        return Ok(normalize(trimmed));
    }

    let decoded = BASE64
        .decode(trimmed.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .filter(|text| is_valid_netscape_cookies(text.trim()))
        .ok_or_else(|| {
            DownloadError::InvalidCookie("payload is neither Netscape text nor base64 of it".into())
        })?;

    Ok(normalize(decoded.trim()))
}

fn normalize(content: &str) -> String {
    let mut out = content.replace("\r\n", "\n");
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}
