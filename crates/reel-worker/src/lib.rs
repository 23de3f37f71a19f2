//! Worker pool.
//!
//! `N` concurrent consumers, each looping dequeue → download cascade →
//! ack/nack → persist → notify. Shutdown stops new dequeues at once and
//! waits for in-flight jobs to finish.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod notifier;
pub mod pool;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use logging::JobLogger;
pub use notifier::{
    notifier_from_config, CompletionEvent, CompletionNotifier, NoopNotifier, WebhookNotifier,
};
pub use pool::{StopHandle, WorkerContext, WorkerPool};
