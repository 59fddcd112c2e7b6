use thiserror::Error;

use crate::job::{JobId, RunId};
use crate::stage::Stage;

/// Failure to move a message through a transport backend.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no {role} backend registered under '{backend}'")]
    UnknownBackend { backend: String, role: &'static str },

    #[error("failed to encode message for endpoint '{endpoint}': {source}")]
    Encode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode message from endpoint '{endpoint}': {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("send to endpoint '{endpoint}' failed: {source}")]
    Send {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("receiver for endpoint '{endpoint}' failed: {source}")]
    Receive {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Missing or malformed configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration key '{0}'")]
    Missing(String),

    #[error("invalid value '{value}' for configuration key '{key}': {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Failure while handling an orchestrator message.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("store operation failed: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("job {job_id} not found")]
    UnknownJob { job_id: JobId },

    #[error("run {run_id} not found")]
    UnknownRun { run_id: RunId },

    #[error("job {job_id} belongs to stage {actual}, message was for {expected}")]
    StageMismatch {
        job_id: JobId,
        expected: Stage,
        actual: Stage,
    },
}

impl OrchestratorError {
    /// Whether redelivering the message could change the outcome.
    ///
    /// Consistency errors are dropped by the receiver loop instead of being
    /// retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Store(_) | OrchestratorError::Transport(_)
        )
    }
}

/// A worker failed its job and the failure was reported to the orchestrator.
///
/// Queue receivers acknowledge the message, since the report already
/// carries the outcome. One-shot receivers return it from
/// [`ReceiverHandle::join`](crate::transport::ReceiverHandle::join) so the
/// hosting process exits unsuccessfully.
#[derive(Debug, Error)]
#[error("{stage} job {job_id} failed: {cause}")]
pub struct JobFailed {
    pub stage: Stage,
    pub job_id: JobId,
    pub cause: String,
}

impl JobFailed {
    /// Whether `err` is a reported job failure rather than a handling error.
    pub fn is_reported(err: &anyhow::Error) -> bool {
        err.is::<JobFailed>()
    }
}
