//! Filesystem-safe identifiers.
//!
//! Any caller-supplied identifier that ends up in a path goes through
//! [`sanitize_identifier`] first, and [`output_path`] refuses to produce a
//! path outside the artifact directory.

use std::path::{Component, Path, PathBuf};

use crate::error::{DownloadError, DownloadResult};

/// Longest identifier kept in a file name.
pub const MAX_IDENTIFIER_LEN: usize = 128;

const FALLBACK_IDENTIFIER: &str = "job";

/// Reduce an identifier to `[A-Za-z0-9_-]`.
pub fn sanitize_identifier(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_IDENTIFIER_LEN)
        .collect();

    if cleaned.is_empty() {
        FALLBACK_IDENTIFIER.to_string()
    } else {
        cleaned
    }
}

/// Artifact path for a job: `<temp_dir>/<sanitized id>.mp4`.
pub fn output_path(temp_dir: &Path, job_id: &str) -> DownloadResult<PathBuf> {
    let file_name = format!("{}.mp4", sanitize_identifier(job_id));
    let path = temp_dir.join(&file_name);

    let mut components = Path::new(&file_name).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );

    if !single_normal || path.parent() != Some(temp_dir) {
        return Err(DownloadError::InvalidPath(file_name));
    }

    Ok(path)
}
