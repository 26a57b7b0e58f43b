//! Typed error hierarchy for the switchboard orchestrator.
//!
//! Four top-level enums cover the four subsystems:
//! - `EngineError` — stage executor failures, split transient/permanent
//! - `PipelineError` — orchestrator and stage-sequencing failures
//! - `ApprovalError` — approval-gate misuse
//! - `DispatchError` — effect dispatch preconditions

use thiserror::Error;
use uuid::Uuid;

use crate::models::{CallStatus, Stage};

/// Failure from a stage executor.
///
/// Transient errors (network drop, timeout, upstream overload) are eligible
/// for orchestrator-level retry with backoff. Permanent errors (malformed
/// input, unsupported audio) halt the call until a human re-runs the stage.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient engine failure: {message}")]
    Transient { message: String },

    #[error("permanent engine failure: {message}")]
    Permanent { message: String },
}

impl EngineError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message } | Self::Permanent { message } => message,
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return Self::transient(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                return Self::transient(format!("HTTP {}: {}", status, err));
            }
            return Self::permanent(format!("HTTP {}: {}", status, err));
        }
        // Request never reached the wire or the body failed mid-stream;
        // safe to retry either way.
        Self::transient(err.to_string())
    }
}

/// Errors from the pipeline orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("call {call_id} not found")]
    CallNotFound { call_id: Uuid },

    #[error("call {call_id} is cancelled")]
    CallCancelled { call_id: Uuid },

    #[error("call {call_id} is already {status}")]
    AlreadyTerminal { call_id: Uuid, status: CallStatus },

    #[error("call {call_id} is {status}; stage {stage} is not runnable")]
    StageNotRunnable {
        call_id: Uuid,
        stage: Stage,
        status: CallStatus,
    },

    #[error("stage {stage} failed for call {call_id}: {source}")]
    Engine {
        call_id: Uuid,
        stage: Stage,
        #[source]
        source: EngineError,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Errors from the approval gate.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("call {call_id} not found")]
    CallNotFound { call_id: Uuid },

    #[error("call {call_id} is already resolved")]
    AlreadyResolved { call_id: Uuid },

    #[error("call {call_id} is {status}, not awaiting approval")]
    NotAwaitingApproval { call_id: Uuid, status: CallStatus },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Errors from the action dispatcher's preconditions. Failures of the
/// effects themselves are not errors here — they are recorded as
/// ActionResult rows and the dispatch call still succeeds.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("call {call_id} not found")]
    CallNotFound { call_id: Uuid },

    #[error("call {call_id} is {status}, not approved")]
    NotApproved { call_id: Uuid, status: CallStatus },

    #[error("call {call_id} has no live decision")]
    NoDecision { call_id: Uuid },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_classification() {
        let t = EngineError::transient("connection reset");
        assert!(t.is_transient());
        assert_eq!(t.message(), "connection reset");

        let p = EngineError::permanent("unsupported codec");
        assert!(!p.is_transient());
        assert!(p.to_string().contains("unsupported codec"));
    }

    #[test]
    fn pipeline_error_stage_not_runnable_carries_context() {
        let call_id = Uuid::new_v4();
        let err = PipelineError::StageNotRunnable {
            call_id,
            stage: Stage::Decide,
            status: CallStatus::Uploaded,
        };
        let msg = err.to_string();
        assert!(msg.contains("uploaded"));
        assert!(msg.contains("decide"));
    }

    #[test]
    fn pipeline_error_engine_preserves_source() {
        let err = PipelineError::Engine {
            call_id: Uuid::new_v4(),
            stage: Stage::Analyze,
            source: EngineError::transient("503 from analyzer"),
        };
        match &err {
            PipelineError::Engine { source, .. } => assert!(source.is_transient()),
            _ => panic!("Expected Engine variant"),
        }
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn approval_errors_are_matchable() {
        let call_id = Uuid::new_v4();
        let err = ApprovalError::AlreadyResolved { call_id };
        assert!(matches!(err, ApprovalError::AlreadyResolved { .. }));

        let err = ApprovalError::NotAwaitingApproval {
            call_id,
            status: CallStatus::Transcribed,
        };
        assert!(err.to_string().contains("transcribed"));
    }

    #[test]
    fn dispatch_error_not_approved_carries_status() {
        let err = DispatchError::NotApproved {
            call_id: Uuid::new_v4(),
            status: CallStatus::AwaitingApproval,
        };
        assert!(err.to_string().contains("awaiting_approval"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&EngineError::transient("x"));
        assert_std_error(&PipelineError::CallNotFound {
            call_id: Uuid::new_v4(),
        });
        assert_std_error(&ApprovalError::AlreadyResolved {
            call_id: Uuid::new_v4(),
        });
        assert_std_error(&DispatchError::NoDecision {
            call_id: Uuid::new_v4(),
        });
    }
}
