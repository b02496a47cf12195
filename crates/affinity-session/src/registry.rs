//! In-memory session registry.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use affinity_core::{JobId, SessionContext, SessionProbe, SessionReference, WorkerId};
use thiserror::Error;

/// Registry error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No session bound for job {0}")]
    UnknownSession(JobId),
    #[error("Job {job} is already held by {holder}")]
    AlreadyHeld { job: JobId, holder: WorkerId },
}

struct Entry {
    reference: SessionReference,
    holder: Option<WorkerId>,
}

/// Maps each in-flight job to the session its steps run in.
///
/// An entry exists from the job's first step until the job is released
/// after finishing. Entries are keyed by job; liveness probes arrive with a
/// token and are answered by scanning the current entries.
pub struct SessionRegistry {
    entries: RwLock<HashMap<JobId, Entry>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the session bound to `job`, allocating one on first use.
    pub fn bind(&self, job: JobId) -> SessionReference {
        let mut entries = self.write();
        entries
            .entry(job)
            .or_insert_with(|| {
                let reference = SessionReference::generate();
                tracing::debug!(%job, session = %reference, "Bound new session");
                Entry {
                    reference,
                    holder: None,
                }
            })
            .reference
            .clone()
    }

    /// Bind `job`'s session to `worker` for the lifetime of the returned guard.
    ///
    /// # Errors
    /// Returns `UnknownSession` if `job` was never bound, or `AlreadyHeld`
    /// if another binding for `job` is still alive.
    pub fn enter(
        &self,
        job: JobId,
        worker: WorkerId,
    ) -> Result<SessionBinding<'_>, RegistryError> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(&job)
            .ok_or(RegistryError::UnknownSession(job))?;

        if let Some(holder) = entry.holder {
            return Err(RegistryError::AlreadyHeld { job, holder });
        }
        entry.holder = Some(worker);

        Ok(SessionBinding {
            registry: self,
            context: SessionContext::new(job, worker, entry.reference.clone()),
        })
    }

    /// Remove `job`'s session. Called once, after the job finished.
    ///
    /// # Errors
    /// Returns `UnknownSession` if no session is bound for `job`.
    pub fn release(&self, job: JobId) -> Result<SessionReference, RegistryError> {
        let entry = self
            .write()
            .remove(&job)
            .ok_or(RegistryError::UnknownSession(job))?;
        tracing::debug!(%job, session = %entry.reference, "Released session");
        Ok(entry.reference)
    }

    /// Session currently bound to `job`.
    ///
    /// # Errors
    /// Returns `UnknownSession` if no session is bound for `job`.
    pub fn lookup(&self, job: JobId) -> Result<SessionReference, RegistryError> {
        self.read()
            .get(&job)
            .map(|entry| entry.reference.clone())
            .ok_or(RegistryError::UnknownSession(job))
    }

    /// Whether some active job still owns `token`.
    #[must_use]
    pub fn is_alive(&self, token: &str) -> bool {
        self.read()
            .values()
            .any(|entry| entry.reference.as_str() == token)
    }

    /// Jobs currently bound to a worker.
    #[must_use]
    pub fn held_jobs(&self) -> Vec<JobId> {
        let mut held: Vec<JobId> = self
            .read()
            .iter()
            .filter(|(_, entry)| entry.holder.is_some())
            .map(|(job, _)| *job)
            .collect();
        held.sort_unstable();
        held
    }

    /// Sessions of all in-flight jobs.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<SessionReference> {
        self.read()
            .values()
            .map(|entry| entry.reference.clone())
            .collect()
    }

    /// Number of in-flight sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no session is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionProbe for SessionRegistry {
    fn is_alive(&self, token: &str) -> bool {
        Self::is_alive(self, token)
    }
}

/// Scoped binding of a job's session to one worker.
///
/// Dropping the binding clears the holder, whichever way the step ended.
pub struct SessionBinding<'a> {
    registry: &'a SessionRegistry,
    context: SessionContext,
}

impl SessionBinding<'_> {
    /// Context to pass to every remote call made under this binding.
    #[must_use]
    pub const fn context(&self) -> &SessionContext {
        &self.context
    }

    /// The bound session.
    #[must_use]
    pub const fn reference(&self) -> &SessionReference {
        &self.context.session
    }
}

impl Drop for SessionBinding<'_> {
    fn drop(&mut self) {
        let mut entries = self.registry.write();
        if let Some(entry) = entries.get_mut(&self.context.job) {
            if entry.holder == Some(self.context.worker) {
                entry.holder = None;
            }
        }
    }
}
