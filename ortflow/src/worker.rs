//! Worker side of a stage endpoint.
//!
//! A [`StageWorker`] executes one job per request. The surrounding
//! [`StageWorkerHandler`] reports the outcome to the orchestrator as a
//! `<Stage>WorkerResult` or `<Stage>WorkerError`, reusing the request's
//! header so the trace id follows the job. After a failure is reported the
//! handler returns [`JobFailed`], which queue receivers acknowledge and the
//! one-shot Kubernetes receiver turns into an unsuccessful exit.

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use crate::config::TransportConfig;
use crate::error::JobFailed;
use crate::message::{JobRequest, Message, MessageHeader, OrchestratorMessage};
use crate::telemetry;
use crate::transport::{
    EndpointHandler, MessageSender, OrchestratorEndpoint, ReceiverHandle, StageEndpoint,
    TransportRegistry, start_receiver,
};

/// Executes the jobs of one stage.
#[async_trait]
pub trait StageWorker<E: StageEndpoint>: Send + Sync {
    /// Run the job named by `request`.
    ///
    /// An error is reported to the orchestrator as the job's failure cause.
    async fn process(&self, header: &MessageHeader, request: &E::Payload) -> anyhow::Result<()>;
}

/// Adapts a [`StageWorker`] to a receiver and reports its outcomes.
pub struct StageWorkerHandler<E, W> {
    worker: Arc<W>,
    reporter: MessageSender<OrchestratorEndpoint>,
    _endpoint: PhantomData<fn() -> E>,
}

impl<E: StageEndpoint, W> fmt::Debug for StageWorkerHandler<E, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageWorkerHandler")
            .field("endpoint", &E::NAME)
            .field("worker_type", &type_name::<W>())
            .finish()
    }
}

impl<E, W> StageWorkerHandler<E, W>
where
    E: StageEndpoint,
    W: StageWorker<E> + 'static,
{
    pub fn new(worker: Arc<W>, reporter: MessageSender<OrchestratorEndpoint>) -> Self {
        Self {
            worker,
            reporter,
            _endpoint: PhantomData,
        }
    }
}

#[async_trait]
impl<E, W> EndpointHandler<E> for StageWorkerHandler<E, W>
where
    E: StageEndpoint,
    W: StageWorker<E> + 'static,
{
    async fn handle(&self, message: Message<E::Payload>) -> anyhow::Result<()> {
        let stage = <E::Payload as JobRequest>::STAGE;
        let job_id = message.payload.job_id();

        let outcome = self
            .worker
            .process(&message.header, &message.payload)
            .instrument(telemetry::job_span(stage, job_id))
            .await;

        let failure = outcome.err().map(|err| {
            tracing::warn!(%stage, %job_id, "job failed: {err:#}");
            format!("{err:#}")
        });
        let report = match &failure {
            None => OrchestratorMessage::worker_result(stage, job_id),
            Some(cause) => OrchestratorMessage::worker_error(stage, job_id, Some(cause.clone())),
        };

        // A failed report makes the request redeliverable, so the job may run again.
        self.reporter
            .send(&Message::new(message.header, report))
            .await?;

        match failure {
            None => Ok(()),
            Some(cause) => Err(JobFailed {
                stage,
                job_id,
                cause,
            }
            .into()),
        }
    }
}

/// Receive requests for `E` and report outcomes to the orchestrator, using
/// the configured receiver of `E` and sender of the orchestrator endpoint.
pub async fn run_stage_worker<E, W>(
    registry: &TransportRegistry,
    config: &TransportConfig,
    worker: Arc<W>,
) -> anyhow::Result<ReceiverHandle>
where
    E: StageEndpoint,
    W: StageWorker<E> + 'static,
{
    let reporter = registry
        .message_sender::<OrchestratorEndpoint>(config)
        .await?;
    let receiver = registry.create_receiver(E::NAME, config).await?;
    let handler = Arc::new(StageWorkerHandler::<E, W>::new(worker, reporter));

    start_receiver::<E, _>(receiver.as_ref(), handler).await
}
