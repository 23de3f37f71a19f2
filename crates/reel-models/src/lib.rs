//! Shared data models for the reel download service.
//!
//! This crate defines the core types shared by the API, queue and worker:
//! - `Job`: a single download request and its lifecycle
//! - `DownloadMethod` / `DownloadArtifact`: what the downloader produced
//! - Human-readable size parsing used by several config layers

pub mod download;
pub mod job;
pub mod size;

pub use download::{AttemptRecord, DownloadArtifact, DownloadMethod};
pub use job::{Job, JobId, JobStatus, TransitionError};
pub use size::{parse_size, DEFAULT_SIZE_BYTES};
