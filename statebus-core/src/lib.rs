//! # statebus-core
//!
//! Statechart interpreter for statebus.
//!
//! This crate provides:
//! - The JSON chart DSL and its compiled, immutable form
//! - Guard expressions over context and event data
//! - The binding table for actions, guards and invoked services
//! - The interpreter: exclusive transition lock, microstep cascade,
//!   deferred sends and bounded disposal

pub mod action;
pub mod binding;
pub mod chart;
pub mod definition;
pub mod error;
pub mod event;
pub mod guard;
pub mod interpreter;
pub mod sink;
pub mod snapshot;
mod step;

pub use action::{ActionContext, Envelope, SendIntent, SendTarget};
pub use binding::{
    ActionError, Bindings, GuardContext, GuardError, ServiceContext, ServiceError,
};
pub use chart::{Chart, StateIndex, StateKind, StateNode, Transition};
pub use definition::{ChartDefinition, StateDefinition, StateType};
pub use error::{BindingKind, CoreError};
pub use event::{Event, EventOrigin, InvocationId};
pub use guard::GuardExpr;
pub use interpreter::{Interpreter, InterpreterOptions, DEFAULT_MAX_MICROSTEPS};
pub use sink::{ChannelSink, EventSink, UnroutedSink};
pub use snapshot::{DisposeOutcome, Lifecycle, MachineSnapshot, StateChange};
