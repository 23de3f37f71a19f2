//! Job definitions and the job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::download::{AttemptRecord, DownloadArtifact, DownloadMethod};

/// Unique identifier for a job.
///
/// Backed by a UUIDv7 so identifiers sort roughly by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new time-ordered job ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job status.
///
/// Jobs only move forward: `queued -> active -> {succeeded | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue
    #[default]
    Queued,
    /// Held by a worker, or waiting for a scheduled retry
    Active,
    /// Downloaded successfully
    Succeeded,
    /// Failed terminally
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    /// Parse from the wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "active" => Some(JobStatus::Active),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Active)
                | (JobStatus::Active, JobStatus::Succeeded)
                | (JobStatus::Active, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected job state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid job transition for {job_id}: {from} -> {to}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// A single reel download request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source_url: String,
    pub status: JobStatus,
    /// Failed queue deliveries so far
    pub attempts: u32,
    /// Strategy that produced the artifact
    pub method: Option<DownloadMethod>,
    /// Last failure message
    pub error: Option<String>,
    pub artifact: Option<DownloadArtifact>,
    /// Cascade attempts from the most recent run
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set while a retry is scheduled
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new queued job for a source URL.
    pub fn new(source_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            source_url: source_url.into(),
            status: JobStatus::Queued,
            attempts: 0,
            method: None,
            error: None,
            artifact: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            next_attempt_at: None,
        }
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                job_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Hand the job to a consumer.
    ///
    /// A job that is already `active` (redelivery after a lost lease, or a
    /// scheduled retry coming due) stays `active`; terminal jobs are rejected.
    pub fn activate(&mut self) -> Result<(), TransitionError> {
        match self.status {
            JobStatus::Active => {
                self.updated_at = Utc::now();
            }
            _ => self.transition(JobStatus::Active)?,
        }
        self.next_attempt_at = None;
        if self.started_at.is_none() {
            self.started_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Record a successful download.
    pub fn succeed(&mut self, artifact: DownloadArtifact) -> Result<(), TransitionError> {
        self.transition(JobStatus::Succeeded)?;
        self.method = Some(artifact.method);
        self.error = None;
        self.history = artifact.attempts.clone();
        self.artifact = Some(artifact);
        self.finished_at = Some(self.updated_at);
        Ok(())
    }

    /// Record a terminal failure.
    pub fn fail(
        &mut self,
        message: impl Into<String>,
        history: Vec<AttemptRecord>,
    ) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(message.into());
        self.history = history;
        self.finished_at = Some(self.updated_at);
        Ok(())
    }

    /// Keep the job `active` and park it until `at`.
    pub fn schedule_retry(
        &mut self,
        message: impl Into<String>,
        history: Vec<AttemptRecord>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status != JobStatus::Active {
            return Err(TransitionError {
                job_id: self.id.clone(),
                from: self.status,
                to: JobStatus::Active,
            });
        }
        self.error = Some(message.into());
        self.history = history;
        self.next_attempt_at = Some(at);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Count one failed delivery and return the new total.
    pub fn record_failed_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }
}
