//! Session binding passed to every remote call.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a scheduled job, unique within one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a pool worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Opaque token naming one logical remote session.
///
/// Tokens are never reused: every call to [`SessionReference::generate`]
/// yields a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionReference(String);

impl SessionReference {
    /// Allocate a fresh session token.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("session-{}", Uuid::new_v4()))
    }

    /// Wrap a token received from the remote side.
    #[must_use]
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Explicit session binding for one remote call.
///
/// The executor decides which remote session a call belongs to by looking
/// at `session`, never at ambient thread state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Job the call is made for.
    pub job: JobId,
    /// Worker currently executing the job.
    pub worker: WorkerId,
    /// Session the call belongs to.
    pub session: SessionReference,
}

impl SessionContext {
    /// Create a context binding `job` on `worker` to `session`.
    #[must_use]
    pub const fn new(job: JobId, worker: WorkerId, session: SessionReference) -> Self {
        Self {
            job,
            worker,
            session,
        }
    }
}
