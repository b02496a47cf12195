//! Core traits for remote execution and session probing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{SessionContext, SessionReference};

/// Output of one remote call.
pub type StepOutput = Value;

/// Already-resolved description of a remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// Remote operation name.
    pub name: String,
    /// Call parameters.
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl StepDescriptor {
    /// Describe a call to `name` without parameters.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    /// Add a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Get a parameter by key.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

/// Executor error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Remote call failed: {0}")]
    Remote(String),
    #[error("Unknown step: {0}")]
    UnknownStep(String),
    #[error("No open session: {0}")]
    NoSession(SessionReference),
    #[error("Session already open: {0}")]
    SessionAlreadyOpen(SessionReference),
    #[error("Executor unavailable: {0}")]
    Unavailable(String),
}

/// Trait for remote step executors.
///
/// Every call carries the session it belongs to in `ctx`. Calls made
/// between `begin_session` and `end_session` for the same
/// `ctx.session` share one remote context; calls outside that window are
/// independent of each other.
#[async_trait]
pub trait RemoteStepExecutor: Send + Sync {
    /// Open a persistent remote context for `ctx.session`.
    async fn begin_session(&self, ctx: &SessionContext) -> Result<(), ExecutorError>;

    /// Release the remote context opened for `ctx.session`.
    async fn end_session(&self, ctx: &SessionContext) -> Result<(), ExecutorError>;

    /// Execute one remote operation.
    async fn execute_step(
        &self,
        ctx: &SessionContext,
        step: &StepDescriptor,
    ) -> Result<StepOutput, ExecutorError>;
}

/// Liveness probe answered for the remote side.
pub trait SessionProbe: Send + Sync {
    /// Whether `token` still denotes an active job's session.
    fn is_alive(&self, token: &str) -> bool;
}
