use std::fmt::{Debug, Display};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::message::{
    AdvisorRequest, AnalyzerRequest, EvaluatorRequest, JobRequest, OrchestratorMessage,
    ReporterRequest, ScannerRequest,
};
use crate::stage::Stage;

/// Untyped name of a logical message channel.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EndpointName {
    Orchestrator,
    Analyzer,
    Advisor,
    Scanner,
    Evaluator,
    Reporter,
}

impl EndpointName {
    pub const ALL: [EndpointName; 6] = [
        EndpointName::Orchestrator,
        EndpointName::Analyzer,
        EndpointName::Advisor,
        EndpointName::Scanner,
        EndpointName::Evaluator,
        EndpointName::Reporter,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            EndpointName::Orchestrator => "orchestrator",
            EndpointName::Analyzer => "analyzer",
            EndpointName::Advisor => "advisor",
            EndpointName::Scanner => "scanner",
            EndpointName::Evaluator => "evaluator",
            EndpointName::Reporter => "reporter",
        }
    }

    /// Prefix of this endpoint's configuration keys.
    pub const fn config_prefix(&self) -> &'static str {
        match self {
            EndpointName::Orchestrator => "ORCHESTRATOR",
            EndpointName::Analyzer => "ANALYZER",
            EndpointName::Advisor => "ADVISOR",
            EndpointName::Scanner => "SCANNER",
            EndpointName::Evaluator => "EVALUATOR",
            EndpointName::Reporter => "REPORTER",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        EndpointName::ALL
            .into_iter()
            .find(|endpoint| endpoint.as_str().eq_ignore_ascii_case(name))
    }

    /// The stage served by this endpoint; `None` for the orchestrator.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            EndpointName::Orchestrator => None,
            EndpointName::Analyzer => Some(Stage::Analyzer),
            EndpointName::Advisor => Some(Stage::Advisor),
            EndpointName::Scanner => Some(Stage::Scanner),
            EndpointName::Evaluator => Some(Stage::Evaluator),
            EndpointName::Reporter => Some(Stage::Reporter),
        }
    }
}

impl From<Stage> for EndpointName {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Analyzer => EndpointName::Analyzer,
            Stage::Advisor => EndpointName::Advisor,
            Stage::Scanner => EndpointName::Scanner,
            Stage::Evaluator => EndpointName::Evaluator,
            Stage::Reporter => EndpointName::Reporter,
        }
    }
}

impl Display for EndpointName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static descriptor of a channel and the payload it carries.
pub trait Endpoint: Send + Sync + 'static {
    type Payload: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    const NAME: EndpointName;
    const CONFIG_PREFIX: &'static str = Self::NAME.config_prefix();
}

/// An endpoint whose payload asks a stage worker to execute a job.
pub trait StageEndpoint: Endpoint<Payload: JobRequest> {}

impl<E> StageEndpoint for E where E: Endpoint<Payload: JobRequest> {}

macro_rules! endpoint {
    ($name:ident, $payload:ty, $endpoint:expr) => {
        #[derive(Clone, Copy, Debug, Default)]
        pub struct $name;

        impl Endpoint for $name {
            type Payload = $payload;

            const NAME: EndpointName = $endpoint;
        }
    };
}

endpoint!(OrchestratorEndpoint, OrchestratorMessage, EndpointName::Orchestrator);
endpoint!(AnalyzerEndpoint, AnalyzerRequest, EndpointName::Analyzer);
endpoint!(AdvisorEndpoint, AdvisorRequest, EndpointName::Advisor);
endpoint!(ScannerEndpoint, ScannerRequest, EndpointName::Scanner);
endpoint!(EvaluatorEndpoint, EvaluatorRequest, EndpointName::Evaluator);
endpoint!(ReporterEndpoint, ReporterRequest, EndpointName::Reporter);
