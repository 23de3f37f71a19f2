//! Durable job queue for reel downloads.
//!
//! This crate provides:
//! - The `JobQueue` contract (enqueue, dequeue, heartbeat, ack, nack)
//! - A Redis Streams implementation with consumer groups, visibility
//!   timeout redelivery, delayed retries and a dead letter stream
//! - An in-process implementation with the same semantics
//! - Exponential backoff policy for retries

pub mod backoff;
pub mod config;
pub mod error;
pub mod memory;
pub mod queue;
pub mod redis_queue;

pub use backoff::BackoffPolicy;
pub use config::{QueueBackend, QueueConfig};
pub use error::{QueueError, QueueResult};
pub use memory::MemoryJobQueue;
pub use queue::{Delivery, JobFailure, JobQueue, NackDisposition, QueueStats};
pub use redis_queue::RedisJobQueue;
