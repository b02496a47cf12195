//! Transport layer for the remote side and operators.
//!
//! Provides:
//! - Wire protocol (JSON probe and report messages)
//! - HTTP liveness probe (feature: http)

pub mod protocol;

#[cfg(feature = "http")]
pub mod http;

pub use protocol::{JobReportMessage, ProbeRequest, ProbeResponse};
