//! Downloader configuration.

use std::path::PathBuf;
use std::time::Duration;

use reel_models::parse_size;

use crate::error::{DownloadError, DownloadResult};

/// Third-party conversion service settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Endpoint that resolves a source URL to a direct media URL
    pub api_url: String,
    pub api_key: Option<String>,
    /// Value for the `x-rapidapi-host` header
    pub api_host: Option<String>,
}

/// Downloader configuration.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Directory all artifacts are written to
    pub temp_dir: PathBuf,
    /// Fixed location of the session cookie artifact
    pub cookie_path: PathBuf,
    pub max_duration_secs: u64,
    pub max_filesize_bytes: u64,
    /// Per-strategy timeout
    pub timeout: Duration,
    /// yt-dlp executable name or path
    pub ytdlp_binary: String,
    /// Strategy B is only built when this is set
    pub proxy: Option<ProxyConfig>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        Self {
            temp_dir: tmp.join("reels"),
            cookie_path: tmp.join("reel-session-cookies.txt"),
            max_duration_secs: 300,
            max_filesize_bytes: 100 * 1024 * 1024,
            timeout: Duration::from_secs(120),
            ytdlp_binary: "yt-dlp".to_string(),
            proxy: None,
        }
    }
}

impl DownloaderConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let proxy = std::env::var("PROXY_API_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(|api_url| ProxyConfig {
                api_url,
                api_key: std::env::var("PROXY_API_KEY").ok().filter(|s| !s.is_empty()),
                api_host: std::env::var("PROXY_API_HOST").ok().filter(|s| !s.is_empty()),
            });

        Self {
            temp_dir: std::env::var("DOWNLOAD_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            cookie_path: std::env::var("SESSION_COOKIE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.cookie_path),
            max_duration_secs: std::env::var("DOWNLOAD_MAX_DURATION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_duration_secs),
            max_filesize_bytes: std::env::var("DOWNLOAD_MAX_FILESIZE")
                .map(|s| parse_size(&s))
                .unwrap_or(defaults.max_filesize_bytes),
            timeout: std::env::var("DOWNLOAD_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            ytdlp_binary: std::env::var("YTDLP_PATH").unwrap_or(defaults.ytdlp_binary),
            proxy,
        }
    }

    /// Resolve the yt-dlp executable on `PATH` (or check an explicit path).
    pub fn locate_ytdlp(&self) -> DownloadResult<PathBuf> {
        which::which(&self.ytdlp_binary)
            .map_err(|e| DownloadError::ToolMissing(format!("{}: {}", self.ytdlp_binary, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_locate_missing_binary() {
        let config = DownloaderConfig {
            ytdlp_binary: "definitely-not-a-real-yt-dlp-binary".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.locate_ytdlp(),
            Err(DownloadError::ToolMissing(_))
        ));
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        for var in [
            "DOWNLOAD_TEMP_DIR",
            "DOWNLOAD_MAX_DURATION_SECS",
            "DOWNLOAD_MAX_FILESIZE",
            "DOWNLOAD_TIMEOUT_SECS",
            "PROXY_API_URL",
        ] {
            std::env::remove_var(var);
        }

        let config = DownloaderConfig::from_env();
        assert_eq!(config.max_duration_secs, 300);
        assert_eq!(config.max_filesize_bytes, 100 * 1024 * 1024);
        assert_eq!(config.timeout, Duration::from_secs(120));
        assert!(config.temp_dir.ends_with("reels"));
        assert!(config.proxy.is_none());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("DOWNLOAD_MAX_FILESIZE", "50mb");
        std::env::set_var("DOWNLOAD_MAX_DURATION_SECS", "not-a-number");
        std::env::set_var("PROXY_API_URL", "https://proxy.example/api");

        let config = DownloaderConfig::from_env();
        assert_eq!(config.max_filesize_bytes, 50 * 1024 * 1024);
        assert_eq!(config.max_duration_secs, 300);
        assert_eq!(
            config.proxy.map(|p| p.api_url).as_deref(),
            Some("https://proxy.example/api")
        );

        std::env::remove_var("DOWNLOAD_MAX_FILESIZE");
        std::env::remove_var("DOWNLOAD_MAX_DURATION_SECS");
        std::env::remove_var("PROXY_API_URL");
    }
}
