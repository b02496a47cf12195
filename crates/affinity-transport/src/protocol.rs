//! Wire protocol for liveness probes and job reports.

use affinity_core::{JobId, SessionProbe, StepOutput};
use affinity_scheduler::{JobKind, JobOutcome, JobReport};
use serde::{Deserialize, Serialize};

/// Message from the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeRequest {
    /// Does `token` still denote an active job?
    IsAlive { token: String },
    /// Ping for keepalive.
    Ping,
}

/// Answer to a [`ProbeRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeResponse {
    /// Liveness of a session token.
    Liveness { token: String, alive: bool },
    /// Pong response.
    Pong,
    /// Error message.
    Error { message: String },
}

impl ProbeRequest {
    /// Answer this request from `probe`.
    #[must_use]
    pub fn answer(&self, probe: &dyn SessionProbe) -> ProbeResponse {
        match self {
            Self::IsAlive { token } => ProbeResponse::Liveness {
                token: token.clone(),
                alive: probe.is_alive(token),
            },
            Self::Ping => ProbeResponse::Pong,
        }
    }
}

/// Decode one JSON request and answer it.
#[must_use]
pub fn handle_json(probe: &dyn SessionProbe, raw: &str) -> ProbeResponse {
    match serde_json::from_str::<ProbeRequest>(raw) {
        Ok(request) => request.answer(probe),
        Err(e) => {
            tracing::warn!("Invalid probe message: {e}");
            ProbeResponse::Error {
                message: format!("Invalid message: {e}"),
            }
        }
    }
}

/// Flat job report for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReportMessage {
    pub id: JobId,
    pub name: String,
    pub kind: JobKind,
    pub success: bool,
    pub steps_executed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<StepOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown_error: Option<String>,
}

impl From<&JobReport> for JobReportMessage {
    fn from(report: &JobReport) -> Self {
        let (result, error, teardown_error) = match &report.outcome {
            JobOutcome::Succeeded { result } => (Some(result.clone()), None, None),
            JobOutcome::Failed { cause, teardown } => (
                None,
                Some(cause.to_string()),
                teardown.as_ref().map(ToString::to_string),
            ),
        };

        Self {
            id: report.id,
            name: report.name.clone(),
            kind: report.kind,
            success: report.is_success(),
            steps_executed: report.steps_executed,
            session: report.session.as_ref().map(ToString::to_string),
            result,
            error,
            teardown_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use affinity_core::SessionReference;
    use affinity_scheduler::{FailureStage, JobFailure};
    use affinity_session::SessionRegistry;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_is_alive_request() {
        let registry = SessionRegistry::new();
        let session = registry.bind(JobId(1));

        let raw = format!(r#"{{"type":"is_alive","token":"{session}"}}"#);
        assert_eq!(
            handle_json(&registry, &raw),
            ProbeResponse::Liveness {
                token: session.to_string(),
                alive: true
            }
        );

        registry.release(JobId(1)).unwrap();
        assert_eq!(
            handle_json(&registry, &raw),
            ProbeResponse::Liveness {
                token: session.to_string(),
                alive: false
            }
        );
    }

    #[test]
    fn test_ping_and_garbage() {
        let registry = SessionRegistry::new();
        assert_eq!(handle_json(&registry, r#"{"type":"ping"}"#), ProbeResponse::Pong);
        assert!(matches!(
            handle_json(&registry, "not json"),
            ProbeResponse::Error { .. }
        ));
    }

    #[test]
    fn test_report_message_flattens_failure() {
        let report = JobReport {
            id: JobId(3),
            name: "stateful Job-3".into(),
            kind: JobKind::Stateful,
            steps_executed: 2,
            session: Some(SessionReference::from_token("session-3")),
            outcome: JobOutcome::Failed {
                cause: JobFailure::new(FailureStage::Step(3), "boom"),
                teardown: Some(JobFailure::new(FailureStage::EndSession, "gone")),
            },
        };

        let message = JobReportMessage::from(&report);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            json!({
                "id": 3,
                "name": "stateful Job-3",
                "kind": "stateful",
                "success": false,
                "steps_executed": 2,
                "session": "session-3",
                "error": "step 3 failed: boom",
                "teardown_error": "end session failed: gone"
            })
        );
    }
}
