//! # statebus-orchestrator
//!
//! Event-bus orchestration for statebus machines.
//!
//! This crate provides:
//! - Per-machine FIFO queues drained one entry at a time
//! - A bounded worker pool shared by all machines
//! - Routing of deferred sends and service completions after lock release
//! - Transition observers, configuration loading and prometheus metrics

pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
mod router;

pub use config::{ConfigError, MetricsConfig, OrchestratorConfig};
pub use error::OrchestratorError;
pub use metrics::Metrics;
pub use orchestrator::{Orchestrator, TransitionRecord};
pub use queue::{Delivery, DeliveryResult, QueueEntry};
