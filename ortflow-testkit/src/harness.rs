use ortflow::transport::memory::DeliveryOutcome;
use ortflow::transport::{
    AdvisorEndpoint, AnalyzerEndpoint, EndpointName, EvaluatorEndpoint, OrchestratorEndpoint,
    ReporterEndpoint, ScannerEndpoint, typed_handler,
};
use ortflow::*;
use std::sync::Arc;
use uuid::Uuid;

use crate::fixtures::{test_header, testing_transport};
use crate::store::InMemoryRunStore;

/// An [`Orchestrator`] wired to an [`InMemoryRunStore`] and an
/// [`InMemoryBroker`] carrying every endpoint.
///
/// Stage requests accumulate on the broker until a test takes them; worker
/// reports are fed to the orchestrator directly or through the broker.
pub struct TestHarness {
    pub store: InMemoryRunStore,
    pub broker: InMemoryBroker,
    pub registry: TransportRegistry,
    pub transport: TransportConfig,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestHarness {
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_broker(InMemoryBroker::default()).await
    }

    pub async fn with_broker(broker: InMemoryBroker) -> anyhow::Result<Self> {
        let registry = TransportRegistry::new().with_memory(broker.clone());
        Self::with_transport(broker, registry, testing_transport()).await
    }

    /// Harness whose orchestrator sends through the backends `transport`
    /// selects from `registry`. `broker` is the one inspected by the
    /// request helpers.
    pub async fn with_transport(
        broker: InMemoryBroker,
        registry: TransportRegistry,
        transport: TransportConfig,
    ) -> anyhow::Result<Self> {
        let store = InMemoryRunStore::new();
        let senders = StageSenders::from_registry(&registry, &transport).await?;
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(store.clone()), senders));

        Ok(Self {
            store,
            broker,
            registry,
            transport,
            orchestrator,
        })
    }

    /// Hand `payload` to the orchestrator with the test header.
    pub async fn send(&self, payload: OrchestratorMessage) -> Result<(), OrchestratorError> {
        self.orchestrator
            .handle_message(Message::new(test_header(), payload))
            .await
    }

    pub async fn submit(&self, create: CreateOrtRun) -> Result<(), OrchestratorError> {
        self.send(OrchestratorMessage::CreateOrtRun(create)).await
    }

    pub async fn report_result(&self, stage: Stage, job_id: JobId) -> Result<(), OrchestratorError> {
        self.send(OrchestratorMessage::worker_result(stage, job_id))
            .await
    }

    pub async fn report_error(
        &self,
        stage: Stage,
        job_id: JobId,
        error: &str,
    ) -> Result<(), OrchestratorError> {
        self.send(OrchestratorMessage::worker_error(
            stage,
            job_id,
            Some(error.to_string()),
        ))
        .await
    }

    /// Remove and decode the pending requests of a stage endpoint.
    pub fn take_requests(&self, stage: Stage) -> anyhow::Result<Vec<JobId>> {
        self.broker
            .take_messages(stage.into())
            .iter()
            .map(|wire| request_job_id(stage, wire))
            .collect()
    }

    /// Take the pending requests of `stage` and report each job as finished.
    pub async fn complete_stage(&self, stage: Stage) -> anyhow::Result<Vec<JobId>> {
        let jobs = self.take_requests(stage)?;
        for job_id in &jobs {
            self.report_result(stage, *job_id).await?;
        }
        Ok(jobs)
    }

    /// Deliver every message queued on the orchestrator endpoint.
    pub async fn deliver_reports(&self) -> Vec<DeliveryOutcome> {
        let handler = typed_handler::<OrchestratorEndpoint, _>(Arc::clone(&self.orchestrator));
        self.broker
            .drain(EndpointName::Orchestrator, handler.as_ref())
            .await
    }

    pub async fn run(&self, id: RunId) -> anyhow::Result<OrtRun> {
        self.store
            .get_run(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("run {} not found", id))
    }

    pub async fn run_for_request(&self, request_id: Uuid) -> anyhow::Result<OrtRun> {
        self.store
            .list_runs(RunQuery::default())
            .await?
            .into_iter()
            .find(|run| run.request_id == request_id)
            .ok_or_else(|| anyhow::anyhow!("no run for request {}", request_id))
    }

    pub async fn job(&self, run_id: RunId, stage: Stage) -> anyhow::Result<Job> {
        self.store
            .get_job_for_run(run_id, stage)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no {} job for run {}", stage, run_id))
    }
}

fn request_job_id(stage: Stage, wire: &WireMessage) -> anyhow::Result<JobId> {
    let job_id = match stage {
        Stage::Analyzer => wire.decode::<AnalyzerEndpoint>()?.payload.job_id(),
        Stage::Advisor => wire.decode::<AdvisorEndpoint>()?.payload.job_id(),
        Stage::Scanner => wire.decode::<ScannerEndpoint>()?.payload.job_id(),
        Stage::Evaluator => wire.decode::<EvaluatorEndpoint>()?.payload.job_id(),
        Stage::Reporter => wire.decode::<ReporterEndpoint>()?.payload.job_id(),
    };
    Ok(job_id)
}
