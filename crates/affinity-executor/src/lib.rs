//! Remote step executors.
//!
//! Provides:
//! - `CounterExecutor` - In-memory stateful counter backend
//! - Failure injection for exercising error paths

pub mod counter;

pub use counter::{CounterExecutor, GET_COUNTER, INCREMENT_COUNTER};
