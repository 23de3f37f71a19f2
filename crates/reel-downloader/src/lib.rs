//! Reel downloader.
//!
//! Produces a local media file for a source URL by walking an ordered
//! cascade of strategies:
//! - authenticated direct fetch (yt-dlp with the session cookie)
//! - third-party proxy conversion service
//! - unauthenticated direct fetch (yt-dlp without credentials)
//!
//! Each attempt's error is classified as terminal (abort the cascade) or
//! retryable via the next strategy.

pub mod cascade;
pub mod config;
pub mod cookie;
pub mod error;
pub mod identifier;
pub mod metrics;
pub mod proxy;
pub mod strategy;
pub mod ytdlp;

pub use cascade::Cascade;
pub use config::{DownloaderConfig, ProxyConfig};
pub use cookie::SessionCookie;
pub use error::{CascadeError, DownloadError, DownloadResult};
pub use identifier::{output_path, sanitize_identifier};
pub use proxy::ProxyStrategy;
pub use strategy::{AttemptOutcome, DownloadRequest, DownloadStrategy};
pub use ytdlp::YtDlpStrategy;
