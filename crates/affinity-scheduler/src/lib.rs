//! Session-affine multi-step job scheduler.
//!
//! A fixed pool of workers drains a shared FIFO of multi-step jobs, running
//! exactly one step per dequeue and appending unfinished jobs back to the
//! tail. Stateful jobs keep every step in one remote session no matter
//! which worker serves it.
//!
//! Provides:
//! - `Scheduler` - Seed jobs, run the pool, collect reports
//! - `Job` / `JobSpec` - Stateless and stateful multi-step work
//! - `JobQueue` - Shared FIFO with timed dequeue
//! - `SchedulerConfig` - Pool size and idle timeout

pub mod config;
pub mod job;
pub mod queue;
pub mod report;
pub mod scheduler;
mod worker;

pub use config::{ConfigError, SchedulerConfig};
pub use job::{Job, JobKind, JobSpec};
pub use queue::{JobQueue, QueueClosed};
pub use report::{FailureStage, JobFailure, JobOutcome, JobReport, RunReport, WorkerSummary};
pub use scheduler::{Scheduler, SchedulerError};
