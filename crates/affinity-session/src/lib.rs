//! Session registry for session-affine jobs.
//!
//! Provides:
//! - `SessionRegistry` - Map in-flight jobs to their remote sessions
//! - `SessionBinding` - Scoped binding of a job's session to one worker

pub mod registry;

pub use registry::{RegistryError, SessionBinding, SessionRegistry};
