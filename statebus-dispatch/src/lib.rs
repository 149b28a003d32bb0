//! # statebus-dispatch
//!
//! Multi-subscriber dispatch primitives with deterministic ordering.
//!
//! This crate provides:
//! - [`PriorityHandler`] - synchronous fan-out in ascending priority order
//! - [`SequentialExecutor`] - async fan-out where whole invocations are serialized
//! - [`SynchronizedHandler`] - synchronous fan-out inside one critical section
//!
//! None of these know anything about state machines; the interpreter and the
//! orchestrator build their notification paths on top of them.

pub mod error;
pub mod priority;
pub mod sequential;
pub mod subscriber;
pub mod synchronized;

pub use error::DispatchError;
pub use priority::PriorityHandler;
pub use sequential::SequentialExecutor;
pub use subscriber::{Priority, SubscriptionId};
pub use synchronized::SynchronizedHandler;
