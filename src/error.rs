use crate::models::{JobState, Stage};
use crate::store::StoreError;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Failures raised while advancing a bulk import.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ImportError {
    #[error("bulk query submission rejected: {0}")]
    Submission(String),
    #[error("transient poll failure: {0}")]
    TransientPoll(String),
    #[error("bulk operation poll failed: {0}")]
    PermanentPoll(String),
    #[error("transient fetch failure: {0}")]
    TransientFetch(String),
    #[error("malformed export at byte {offset}: {message}")]
    MalformedExport { offset: u64, message: String },
    #[error("catalog sink unavailable: {0}")]
    SinkUnavailable(String),
    #[error("catalog sink rejected {product_id} at byte {offset}: {message}")]
    Sink {
        product_id: String,
        offset: u64,
        message: String,
    },
    #[error("bulk import exceeded its {}s wall-clock budget", .0.as_secs())]
    Timeout(Duration),
    #[error("gave up after {attempts} retryable failures inside the retry window")]
    AttemptsExhausted { attempts: u32, stage: Stage },
}

impl ImportError {
    pub fn malformed(offset: u64, message: impl Into<String>) -> Self {
        Self::MalformedExport {
            offset,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ImportError::TransientPoll(_)
                | ImportError::TransientFetch(_)
                | ImportError::SinkUnavailable(_)
        )
    }

    pub fn stage(&self) -> Stage {
        match self {
            ImportError::Submission(_) => Stage::Submit,
            ImportError::TransientPoll(_) | ImportError::PermanentPoll(_) => Stage::Poll,
            ImportError::TransientFetch(_) => Stage::Fetch,
            ImportError::MalformedExport { .. } => Stage::Stream,
            ImportError::SinkUnavailable(_) | ImportError::Sink { .. } => Stage::Sink,
            ImportError::Timeout(_) => Stage::Timeout,
            ImportError::AttemptsExhausted { stage, .. } => *stage,
        }
    }

    pub fn offset(&self) -> Option<u64> {
        match self {
            ImportError::MalformedExport { offset, .. } | ImportError::Sink { offset, .. } => {
                Some(*offset)
            }
            _ => None,
        }
    }
}

/// Failures of operator-facing controls.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("target `{0}` is not configured")]
    UnknownTarget(String),
    #[error("integration is not enabled for target `{0}`")]
    IntegrationDisabled(String),
    #[error("bulk import is not enabled for target `{0}`")]
    BulkModeDisabled(String),
    #[error("target `{target}` already has an open bulk import {job_id}")]
    ImportInProgress { target: String, job_id: Uuid },
    #[error("bulk import {0} not found")]
    JobNotFound(Uuid),
    #[error("bulk import {job_id} is already {state}")]
    JobClosed { job_id: Uuid, state: JobState },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_conditions_are_retryable() {
        assert!(ImportError::TransientPoll("503".into()).is_retryable());
        assert!(ImportError::TransientFetch("reset".into()).is_retryable());
        assert!(ImportError::SinkUnavailable("502".into()).is_retryable());
        assert!(!ImportError::PermanentPoll("unknown id".into()).is_retryable());
        assert!(!ImportError::Submission("quota".into()).is_retryable());
        assert!(!ImportError::malformed(10, "bad").is_retryable());
        assert!(!ImportError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn offsets_are_reported_for_stream_and_sink_failures() {
        assert_eq!(ImportError::malformed(77, "bad").offset(), Some(77));
        let sink = ImportError::Sink {
            product_id: "p".into(),
            offset: 9,
            message: "422".into(),
        };
        assert_eq!(sink.offset(), Some(9));
        assert_eq!(sink.stage(), Stage::Sink);
        assert_eq!(ImportError::TransientPoll("x".into()).offset(), None);
    }
}
