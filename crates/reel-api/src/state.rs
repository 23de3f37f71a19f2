//! Application state.

use std::sync::Arc;

use reel_queue::{JobQueue, MemoryJobQueue};
use reel_store::{JobRecordStore, MemoryJobStore};

use crate::admission::Admission;
use crate::broker::Broker;
use crate::config::{AdmissionConfig, ApiConfig};
use crate::lifecycle::Lifecycle;

/// Shared application state.
///
/// Built once by the lifecycle manager; handlers and middleware only ever
/// see these handles, never ambient globals.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn JobRecordStore>,
    /// Absent when running with the in-process queue
    pub broker: Option<Arc<Broker>>,
    pub admission: Arc<Admission>,
    pub lifecycle: Lifecycle,
}

impl AppState {
    /// State backed entirely by in-process collaborators.
    pub fn in_memory(config: ApiConfig, admission: AdmissionConfig) -> Self {
        Self {
            config,
            queue: Arc::new(MemoryJobQueue::default()),
            store: Arc::new(MemoryJobStore::new()),
            broker: None,
            admission: Arc::new(Admission::new(admission, None)),
            lifecycle: Lifecycle::new(),
        }
    }
}
