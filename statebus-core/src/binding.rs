//! Binding table: the host code a chart refers to by name.
//!
//! Charts name actions, guards and services as strings. A [`Bindings`]
//! table maps those names to closures and is consumed once, when the chart
//! is compiled. There is no global registry.

use crate::action::ActionContext;
use crate::event::{Event, InvocationId};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Failure reported by a bound action.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ActionError {
    pub message: String,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure reported by a bound guard. The guard then counts as false.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct GuardError {
    pub message: String,
}

impl GuardError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure reported by an invoked service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{0}")]
    Failed(String),

    /// The service observed cancellation and gave up. Produces no event.
    #[error("cancelled")]
    Cancelled,
}

pub type ActionFn = Arc<dyn Fn(&mut ActionContext<'_>) -> Result<(), ActionError> + Send + Sync>;
pub type GuardFn = Arc<dyn Fn(&GuardContext<'_>) -> Result<bool, GuardError> + Send + Sync>;
pub type ServiceFn =
    Arc<dyn Fn(ServiceContext) -> BoxFuture<'static, Result<Value, ServiceError>> + Send + Sync>;

/// Read-only view handed to a bound guard.
#[derive(Debug, Clone, Copy)]
pub struct GuardContext<'a> {
    pub machine_id: &'a str,
    /// Id of the state that declares the transition.
    pub state: &'a str,
    pub event: &'a Event,
    pub context: &'a Value,
}

/// Everything a service gets when its state is entered.
///
/// The context is a copy taken when the service starts; the service never
/// sees later changes and cannot mutate the machine.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub machine_id: String,
    pub state: String,
    pub invoke_id: String,
    pub invocation: InvocationId,
    pub context: Value,
    cancel: watch::Receiver<bool>,
}

impl ServiceContext {
    pub(crate) fn new(
        machine_id: String,
        state: String,
        invoke_id: String,
        invocation: InvocationId,
        context: Value,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            machine_id,
            state,
            invoke_id,
            invocation,
            context,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || self.cancel.has_changed().is_err()
    }

    /// Resolves once the owning state has been exited or the machine disposed.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        // A dropped sender means the invocation is gone too
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Name → closure tables for actions, guards and services.
#[derive(Clone, Default)]
pub struct Bindings {
    actions: HashMap<String, ActionFn>,
    guards: HashMap<String, GuardFn>,
    services: HashMap<String, ServiceFn>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds an action. Rebinding a name replaces the previous closure.
    pub fn action<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut ActionContext<'_>) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        self.actions.insert(name.into(), Arc::new(f));
        self
    }

    pub fn guard<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&GuardContext<'_>) -> Result<bool, GuardError> + Send + Sync + 'static,
    {
        self.guards.insert(name.into(), Arc::new(f));
        self
    }

    pub fn service<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ServiceContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ServiceError>> + Send + 'static,
    {
        let f: ServiceFn = Arc::new(move |ctx| f(ctx).boxed());
        self.services.insert(name.into(), f);
        self
    }

    pub fn get_action(&self, name: &str) -> Option<&ActionFn> {
        self.actions.get(name)
    }

    pub fn get_guard(&self, name: &str) -> Option<&GuardFn> {
        self.guards.get(name)
    }

    pub fn get_service(&self, name: &str) -> Option<&ServiceFn> {
        self.services.get(name)
    }
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut actions: Vec<_> = self.actions.keys().collect();
        let mut guards: Vec<_> = self.guards.keys().collect();
        let mut services: Vec<_> = self.services.keys().collect();
        actions.sort();
        guards.sort();
        services.sort();
        f.debug_struct("Bindings")
            .field("actions", &actions)
            .field("guards", &guards)
            .field("services", &services)
            .finish()
    }
}
