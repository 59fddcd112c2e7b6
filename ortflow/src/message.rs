use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{JobId, RepositoryId};
use crate::stage::{JobConfigurations, Stage};

/// Metadata travelling with every message.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    /// Opaque authorization token, passed through untouched.
    pub token: String,
    /// Correlates log lines of one run across services.
    pub trace_id: String,
}

impl MessageHeader {
    pub fn new(token: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            trace_id: trace_id.into(),
        }
    }

    /// A header with an empty token and a freshly generated trace id.
    pub fn generate() -> Self {
        Self::new(String::new(), Uuid::now_v7().to_string())
    }
}

/// A typed message: header plus payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message<P> {
    pub header: MessageHeader,
    pub payload: P,
}

impl<P> Message<P> {
    pub fn new(header: MessageHeader, payload: P) -> Self {
        Self { header, payload }
    }
}

/// A request asking a stage worker to execute one job.
pub trait JobRequest:
    Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const STAGE: Stage;

    fn new(job_id: JobId) -> Self;

    fn job_id(&self) -> JobId;
}

macro_rules! job_request {
    ($name:ident, $field:ident, $stage:expr) => {
        #[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "kind", rename_all = "camelCase")]
        pub struct $name {
            pub $field: JobId,
        }

        impl JobRequest for $name {
            const STAGE: Stage = $stage;

            fn new(job_id: JobId) -> Self {
                Self { $field: job_id }
            }

            fn job_id(&self) -> JobId {
                self.$field
            }
        }
    };
}

job_request!(AnalyzerRequest, analyzer_job_id, Stage::Analyzer);
job_request!(AdvisorRequest, advisor_job_id, Stage::Advisor);
job_request!(ScannerRequest, scanner_job_id, Stage::Scanner);
job_request!(EvaluatorRequest, evaluator_job_id, Stage::Evaluator);
job_request!(ReporterRequest, reporter_job_id, Stage::Reporter);

/// Asks the orchestrator to start a new run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrtRun {
    /// Client-chosen idempotency key; redelivery never creates a second run.
    pub request_id: Uuid,
    pub repository_id: RepositoryId,
    pub revision: String,
    pub job_configs: JobConfigurations,
    #[serde(default)]
    pub job_config_context: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub job_id: JobId,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerError {
    pub job_id: JobId,
    #[serde(default)]
    pub error: Option<String>,
}

/// Everything the orchestrator endpoint receives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum OrchestratorMessage {
    CreateOrtRun(CreateOrtRun),
    AnalyzerWorkerResult(WorkerResult),
    AnalyzerWorkerError(WorkerError),
    AdvisorWorkerResult(WorkerResult),
    AdvisorWorkerError(WorkerError),
    ScannerWorkerResult(WorkerResult),
    ScannerWorkerError(WorkerError),
    EvaluatorWorkerResult(WorkerResult),
    EvaluatorWorkerError(WorkerError),
    ReporterWorkerResult(WorkerResult),
    ReporterWorkerError(WorkerError),
}

/// Outcome reported by a stage worker, with the stage taken from the kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerReport<'a> {
    Result { job_id: JobId },
    Error { job_id: JobId, error: Option<&'a str> },
}

impl WorkerReport<'_> {
    pub fn job_id(&self) -> JobId {
        match self {
            WorkerReport::Result { job_id } | WorkerReport::Error { job_id, .. } => *job_id,
        }
    }
}

impl OrchestratorMessage {
    pub fn worker_result(stage: Stage, job_id: JobId) -> Self {
        let result = WorkerResult { job_id };
        match stage {
            Stage::Analyzer => OrchestratorMessage::AnalyzerWorkerResult(result),
            Stage::Advisor => OrchestratorMessage::AdvisorWorkerResult(result),
            Stage::Scanner => OrchestratorMessage::ScannerWorkerResult(result),
            Stage::Evaluator => OrchestratorMessage::EvaluatorWorkerResult(result),
            Stage::Reporter => OrchestratorMessage::ReporterWorkerResult(result),
        }
    }

    pub fn worker_error(stage: Stage, job_id: JobId, error: Option<String>) -> Self {
        let error = WorkerError { job_id, error };
        match stage {
            Stage::Analyzer => OrchestratorMessage::AnalyzerWorkerError(error),
            Stage::Advisor => OrchestratorMessage::AdvisorWorkerError(error),
            Stage::Scanner => OrchestratorMessage::ScannerWorkerError(error),
            Stage::Evaluator => OrchestratorMessage::EvaluatorWorkerError(error),
            Stage::Reporter => OrchestratorMessage::ReporterWorkerError(error),
        }
    }

    /// The wire discriminant of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorMessage::CreateOrtRun(_) => "CreateOrtRun",
            OrchestratorMessage::AnalyzerWorkerResult(_) => "AnalyzerWorkerResult",
            OrchestratorMessage::AnalyzerWorkerError(_) => "AnalyzerWorkerError",
            OrchestratorMessage::AdvisorWorkerResult(_) => "AdvisorWorkerResult",
            OrchestratorMessage::AdvisorWorkerError(_) => "AdvisorWorkerError",
            OrchestratorMessage::ScannerWorkerResult(_) => "ScannerWorkerResult",
            OrchestratorMessage::ScannerWorkerError(_) => "ScannerWorkerError",
            OrchestratorMessage::EvaluatorWorkerResult(_) => "EvaluatorWorkerResult",
            OrchestratorMessage::EvaluatorWorkerError(_) => "EvaluatorWorkerError",
            OrchestratorMessage::ReporterWorkerResult(_) => "ReporterWorkerResult",
            OrchestratorMessage::ReporterWorkerError(_) => "ReporterWorkerError",
        }
    }

    /// Stage and outcome for worker results and errors, `None` otherwise.
    pub fn worker_report<'a>(&'a self) -> Option<(Stage, WorkerReport<'a>)> {
        use OrchestratorMessage::*;

        let result = |stage, r: &WorkerResult| (stage, WorkerReport::Result { job_id: r.job_id });
        let error = |stage, e: &'a WorkerError| {
            (
                stage,
                WorkerReport::Error {
                    job_id: e.job_id,
                    error: e.error.as_deref(),
                },
            )
        };

        match self {
            CreateOrtRun(_) => None,
            AnalyzerWorkerResult(r) => Some(result(Stage::Analyzer, r)),
            AdvisorWorkerResult(r) => Some(result(Stage::Advisor, r)),
            ScannerWorkerResult(r) => Some(result(Stage::Scanner, r)),
            EvaluatorWorkerResult(r) => Some(result(Stage::Evaluator, r)),
            ReporterWorkerResult(r) => Some(result(Stage::Reporter, r)),
            AnalyzerWorkerError(e) => Some(error(Stage::Analyzer, e)),
            AdvisorWorkerError(e) => Some(error(Stage::Advisor, e)),
            ScannerWorkerError(e) => Some(error(Stage::Scanner, e)),
            EvaluatorWorkerError(e) => Some(error(Stage::Evaluator, e)),
            ReporterWorkerError(e) => Some(error(Stage::Reporter, e)),
        }
    }
}
