//! Reel job service: HTTP API, admission control and process lifecycle.
//!
//! This crate provides:
//! - The enqueue / status REST API
//! - The admission-control middleware chain (rate limits, sanitization,
//!   fingerprinting, API-key and beta gates)
//! - The lifecycle manager that boots and drains every collaborator
//! - Prometheus metrics

pub mod admission;
pub mod bootstrap;
pub mod broker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod middleware;
pub mod panic_hook;
pub mod routes;
pub mod security;
pub mod state;

pub use bootstrap::{bootstrap, drain, start_or_interrupt, AppContext, DrainTrigger, Startup};
pub use config::{AdmissionConfig, ApiConfig};
pub use error::{ApiError, ApiResult};
pub use lifecycle::{DrainReason, Lifecycle, LifecycleState};
pub use routes::create_router;
pub use state::AppState;
