//! Persistent job outcome records.
//!
//! The queue holds live job state; this store keeps a durable record of how
//! each job ended (or last stood) so it stays queryable after the queue's
//! retention window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use reel_models::{DownloadMethod, Job, JobId, JobStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::client::StoreClient;
use crate::error::{StoreError, StoreResult};
use crate::types::{Document, ToFirestoreValue, Value};

/// Flattened view of a job as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub source_url: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub method: Option<DownloadMethod>,
    pub error: Option<String>,
    pub artifact_path: Option<String>,
    pub size_bytes: Option<u64>,
    pub elapsed_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            source_url: job.source_url.clone(),
            status: job.status,
            attempts: job.attempts,
            method: job.method,
            error: job.error.clone(),
            artifact_path: job
                .artifact
                .as_ref()
                .map(|a| a.path.to_string_lossy().into_owned()),
            size_bytes: job.artifact.as_ref().map(|a| a.size_bytes),
            elapsed_ms: job.artifact.as_ref().map(|a| a.elapsed_ms),
            created_at: job.created_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
        }
    }
}

impl JobRecord {
    fn to_fields(&self) -> HashMap<String, Value> {
        let mut fields = HashMap::new();
        fields.insert("job_id".to_string(), self.job_id.as_str().to_firestore_value());
        fields.insert("source_url".to_string(), self.source_url.to_firestore_value());
        fields.insert("status".to_string(), self.status.as_str().to_firestore_value());
        fields.insert("attempts".to_string(), self.attempts.to_firestore_value());
        fields.insert(
            "method".to_string(),
            self.method.map(|m| m.as_str()).to_firestore_value(),
        );
        fields.insert("error".to_string(), self.error.to_firestore_value());
        fields.insert("artifact_path".to_string(), self.artifact_path.to_firestore_value());
        fields.insert("size_bytes".to_string(), self.size_bytes.to_firestore_value());
        fields.insert("elapsed_ms".to_string(), self.elapsed_ms.to_firestore_value());
        fields.insert("created_at".to_string(), self.created_at.to_firestore_value());
        fields.insert("updated_at".to_string(), self.updated_at.to_firestore_value());
        fields.insert("finished_at".to_string(), self.finished_at.to_firestore_value());
        fields
    }

    fn from_document(doc: &Document, job_id: &JobId) -> StoreResult<Self> {
        let status = doc
            .field::<String>("status")
            .and_then(|s| JobStatus::parse(&s))
            .ok_or_else(|| StoreError::invalid_document(format!("job {}: missing status", job_id)))?;
        let source_url = doc
            .field::<String>("source_url")
            .ok_or_else(|| StoreError::invalid_document(format!("job {}: missing source_url", job_id)))?;
        let created_at = doc
            .field::<DateTime<Utc>>("created_at")
            .ok_or_else(|| StoreError::invalid_document(format!("job {}: missing created_at", job_id)))?;

        Ok(Self {
            job_id: job_id.clone(),
            source_url,
            status,
            attempts: doc.field("attempts").unwrap_or(0),
            method: doc
                .field::<String>("method")
                .and_then(|m| DownloadMethod::parse(&m)),
            error: doc.field("error"),
            artifact_path: doc.field("artifact_path"),
            size_bytes: doc.field("size_bytes"),
            elapsed_ms: doc.field("elapsed_ms"),
            created_at,
            updated_at: doc.field("updated_at").unwrap_or(created_at),
            finished_at: doc.field("finished_at"),
        })
    }
}

/// Durable storage for job records.
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Insert or replace the record for this job.
    async fn save(&self, job: &Job) -> StoreResult<()>;

    async fn load(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>>;

    async fn health_check(&self) -> StoreResult<()>;

    /// Release backend resources; later calls fail with `StoreError::Closed`.
    async fn close(&self) -> StoreResult<()>;
}

/// Firestore-backed job records, one document per job.
pub struct FirestoreJobStore {
    client: StoreClient,
}

impl FirestoreJobStore {
    pub fn new(client: StoreClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobRecordStore for FirestoreJobStore {
    async fn save(&self, job: &Job) -> StoreResult<()> {
        let record = JobRecord::from(job);
        self.client
            .upsert_document(
                self.client.collection(),
                job.id.as_str(),
                &Document::new(record.to_fields()),
            )
            .await?;

        counter!("reel_store_records_saved_total", "status" => job.status.as_str()).increment(1);
        debug!(job_id = %job.id, status = %job.status.as_str(), "Saved job record");
        Ok(())
    }

    async fn load(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>> {
        let doc = self
            .client
            .get_document(self.client.collection(), job_id.as_str())
            .await?;

        doc.map(|d| JobRecord::from_document(&d, job_id)).transpose()
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.client.health_check().await
    }

    async fn close(&self) -> StoreResult<()> {
        self.client.close();
        Ok(())
    }
}

/// In-process job records.
#[derive(Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<JobId, JobRecord>>,
    closed: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobRecordStore for MemoryJobStore {
    async fn save(&self, job: &Job) -> StoreResult<()> {
        self.ensure_open()?;
        self.records
            .write()
            .await
            .insert(job.id.clone(), JobRecord::from(job));
        Ok(())
    }

    async fn load(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>> {
        self.ensure_open()?;
        Ok(self.records.read().await.get(job_id).cloned())
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.ensure_open()
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
