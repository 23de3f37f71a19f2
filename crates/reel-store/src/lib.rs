//! Persistent store for job outcomes.
//!
//! This crate provides:
//! - A Firestore REST client (token caching, retries, emulator support)
//! - The `JobRecordStore` contract with Firestore and in-memory backends

pub mod client;
pub mod error;
pub mod metrics;
pub mod repository;
pub mod retry;
pub mod token_cache;
pub mod types;

pub use client::{StoreBackend, StoreClient, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use repository::{FirestoreJobStore, JobRecord, JobRecordStore, MemoryJobStore};
pub use retry::RetryConfig;
pub use types::{Document, FromFirestoreValue, ToFirestoreValue, Value};
