//! Core abstractions for session-affine remote step execution.
//!
//! This crate provides the shared vocabulary:
//! - `JobId` / `WorkerId` - Identities of scheduled work and pool members
//! - `SessionReference` - Opaque token naming one remote session
//! - `SessionContext` - Explicit per-call session binding
//! - Executor and probe traits

pub mod context;
pub mod traits;

pub use context::{JobId, SessionContext, SessionReference, WorkerId};
pub use traits::{
    ExecutorError, RemoteStepExecutor, SessionProbe, StepDescriptor, StepOutput,
};
