//! Download strategy and artifact types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Download strategies, in cascade order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadMethod {
    /// yt-dlp with the session cookie
    AuthenticatedDirect,
    /// Third-party conversion API, then a direct stream
    ProxyConversion,
    /// yt-dlp without credentials
    UnauthenticatedDirect,
}

impl DownloadMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadMethod::AuthenticatedDirect => "authenticated_direct",
            DownloadMethod::ProxyConversion => "proxy_conversion",
            DownloadMethod::UnauthenticatedDirect => "unauthenticated_direct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "authenticated_direct" => Some(DownloadMethod::AuthenticatedDirect),
            "proxy_conversion" => Some(DownloadMethod::ProxyConversion),
            "unauthenticated_direct" => Some(DownloadMethod::UnauthenticatedDirect),
            _ => None,
        }
    }
}

impl fmt::Display for DownloadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One strategy attempt inside a cascade run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub method: DownloadMethod,
    /// `None` when the attempt succeeded
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl AttemptRecord {
    pub fn success(method: DownloadMethod, elapsed_ms: u64) -> Self {
        Self {
            method,
            error: None,
            elapsed_ms,
        }
    }

    pub fn failure(method: DownloadMethod, error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            method,
            error: Some(error.into()),
            elapsed_ms,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// A downloaded media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadArtifact {
    pub path: PathBuf,
    pub method: DownloadMethod,
    /// Wall time of the whole cascade run
    pub elapsed_ms: u64,
    pub size_bytes: u64,
    pub attempts: Vec<AttemptRecord>,
}
