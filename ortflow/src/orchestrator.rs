//! The orchestrator: turns run requests and worker reports into job
//! dispatches and status changes.
//!
//! The orchestrator keeps no in-memory run state. Every message is handled
//! by loading the run's records, applying one status change through the
//! store's compare-and-transition, and recomputing the next step with
//! [`pipeline::evaluate`](crate::pipeline::evaluate). Duplicated or
//! reordered deliveries therefore converge on the same stored state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::Instrument;

use crate::config::TransportConfig;
use crate::error::{OrchestratorError, TransportError};
use crate::job::{Job, JobId, JobStatus, RunId};
use crate::message::{
    CreateOrtRun, JobRequest, Message, MessageHeader, OrchestratorMessage, WorkerReport,
};
use crate::pipeline::{self, Advance};
use crate::run::{NewOrtRun, OrtRun, OrtRunStatus, RunUpdate};
use crate::stage::Stage;
use crate::store::{JobCreation, JobQuery, RunQuery, RunStore, Transition};
use crate::telemetry;
use crate::transport::{
    AdvisorEndpoint, AnalyzerEndpoint, EndpointHandler, EndpointName, EvaluatorEndpoint,
    MessageSender, OrchestratorEndpoint, ReporterEndpoint, ScannerEndpoint, StageEndpoint,
    TransportRegistry,
};

/// Typed senders for every stage endpoint.
#[derive(Clone, Debug)]
pub struct StageSenders {
    pub analyzer: MessageSender<AnalyzerEndpoint>,
    pub advisor: MessageSender<AdvisorEndpoint>,
    pub scanner: MessageSender<ScannerEndpoint>,
    pub evaluator: MessageSender<EvaluatorEndpoint>,
    pub reporter: MessageSender<ReporterEndpoint>,
}

impl StageSenders {
    /// Create senders for all stage endpoints from the configured backends.
    pub async fn from_registry(
        registry: &TransportRegistry,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            analyzer: registry.message_sender(config).await?,
            advisor: registry.message_sender(config).await?,
            scanner: registry.message_sender(config).await?,
            evaluator: registry.message_sender(config).await?,
            reporter: registry.message_sender(config).await?,
        })
    }

    /// Send the request for `job_id` to the worker endpoint of `stage`.
    pub async fn send_request(
        &self,
        stage: Stage,
        header: &MessageHeader,
        job_id: JobId,
    ) -> Result<(), TransportError> {
        match stage {
            Stage::Analyzer => send_request(&self.analyzer, header, job_id).await,
            Stage::Advisor => send_request(&self.advisor, header, job_id).await,
            Stage::Scanner => send_request(&self.scanner, header, job_id).await,
            Stage::Evaluator => send_request(&self.evaluator, header, job_id).await,
            Stage::Reporter => send_request(&self.reporter, header, job_id).await,
        }
    }
}

async fn send_request<E: StageEndpoint>(
    sender: &MessageSender<E>,
    header: &MessageHeader,
    job_id: JobId,
) -> Result<(), TransportError> {
    let message = Message::new(header.clone(), <E::Payload as JobRequest>::new(job_id));
    sender.send(&message).await
}

/// Counts from one [`Orchestrator::recover_pending`] pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecoveryReport {
    /// Stale `CREATED` jobs whose request was sent again.
    pub resent_jobs: usize,
    /// Runs whose pipeline was re-evaluated.
    pub advanced_runs: usize,
    pub failures: usize,
}

pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    senders: StageSenders,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("senders", &self.senders)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(store: Arc<dyn RunStore>, senders: StageSenders) -> Self {
        Self { store, senders }
    }

    pub fn store(&self) -> Arc<dyn RunStore> {
        Arc::clone(&self.store)
    }

    /// Handle one message received on the orchestrator endpoint.
    pub async fn handle_message(
        &self,
        message: Message<OrchestratorMessage>,
    ) -> Result<(), OrchestratorError> {
        let span = telemetry::message_span(
            EndpointName::Orchestrator,
            &message.header,
            message.payload.kind(),
        );
        self.dispatch_message(message).instrument(span).await
    }

    async fn dispatch_message(
        &self,
        message: Message<OrchestratorMessage>,
    ) -> Result<(), OrchestratorError> {
        let Message { header, payload } = message;

        if let OrchestratorMessage::CreateOrtRun(create) = payload {
            return self.handle_create_ort_run(&header, create).await;
        }

        match payload.worker_report() {
            Some((stage, WorkerReport::Result { job_id })) => {
                self.handle_worker_result(&header, stage, job_id).await
            }
            Some((stage, WorkerReport::Error { job_id, error })) => {
                let error = error.map(str::to_owned);
                self.handle_worker_error(&header, stage, job_id, error).await
            }
            None => Ok(()),
        }
    }

    /// Persist a new run and schedule its first jobs.
    ///
    /// A redelivered request finds the run by its request id and only
    /// re-runs the advance step, which is idempotent.
    pub async fn handle_create_ort_run(
        &self,
        header: &MessageHeader,
        create: CreateOrtRun,
    ) -> Result<(), OrchestratorError> {
        let run = self
            .store
            .create_run(NewOrtRun {
                request_id: create.request_id,
                repository_id: create.repository_id,
                revision: create.revision,
                job_configs: create.job_configs,
                job_config_context: create.job_config_context,
                labels: create.labels,
            })
            .await
            .map_err(OrchestratorError::Store)?;

        tracing::info!(
            run_id = %run.id,
            repository_id = %run.repository_id,
            index = run.index,
            "run created"
        );

        if run.resolved_job_configs.is_none() {
            self.store
                .update_run(
                    run.id,
                    RunUpdate {
                        resolved_job_configs: Some(run.job_configs.clone()),
                        labels: None,
                    },
                )
                .await
                .map_err(OrchestratorError::Store)?;
        }

        self.advance_run(header, run.id).await
    }

    /// Record a successful job and advance its run.
    pub async fn handle_worker_result(
        &self,
        header: &MessageHeader,
        stage: Stage,
        job_id: JobId,
    ) -> Result<(), OrchestratorError> {
        self.finish_job(header, stage, job_id, JobStatus::Finished, None)
            .await
    }

    /// Record a failed job and advance its run.
    pub async fn handle_worker_error(
        &self,
        header: &MessageHeader,
        stage: Stage,
        job_id: JobId,
        error: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let error = error.unwrap_or_else(|| format!("{stage} worker reported an error"));
        self.finish_job(header, stage, job_id, JobStatus::Failed, Some(error))
            .await
    }

    async fn finish_job(
        &self,
        header: &MessageHeader,
        stage: Stage,
        job_id: JobId,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let job = self.load_job(stage, job_id).await?;

        if job.is_terminal() {
            telemetry::record_duplicate_delivery(stage, job_id, job.status);
        } else {
            match self
                .store
                .transition_job(job_id, status, Utc::now(), error)
                .await
                .map_err(OrchestratorError::Store)?
            {
                Transition::Applied(job) => telemetry::record_job_transition(&job),
                Transition::Rejected(current) => {
                    telemetry::record_duplicate_delivery(stage, job_id, current.status);
                }
                Transition::NotFound => return Err(OrchestratorError::UnknownJob { job_id }),
            }
        }

        // Advancing again after a duplicate is harmless and repairs a run
        // whose previous advance step was interrupted.
        self.advance_run(header, job.ort_run_id).await
    }

    async fn load_job(&self, stage: Stage, job_id: JobId) -> Result<Job, OrchestratorError> {
        let job = self
            .store
            .get_job(job_id)
            .await
            .map_err(OrchestratorError::Store)?
            .ok_or(OrchestratorError::UnknownJob { job_id })?;

        if job.stage() != stage {
            return Err(OrchestratorError::StageMismatch {
                job_id,
                expected: stage,
                actual: job.stage(),
            });
        }

        Ok(job)
    }

    /// Recompute the run's next step from its stored jobs and carry it out.
    pub async fn advance_run(
        &self,
        header: &MessageHeader,
        run_id: RunId,
    ) -> Result<(), OrchestratorError> {
        async {
            let run = self
                .store
                .get_run(run_id)
                .await
                .map_err(OrchestratorError::Store)?
                .ok_or(OrchestratorError::UnknownRun { run_id })?;

            if run.status.is_terminal() {
                tracing::debug!(status = %run.status, "run already completed");
                return Ok(());
            }

            let jobs = self
                .store
                .get_jobs_for_run(run_id)
                .await
                .map_err(OrchestratorError::Store)?;

            match pipeline::evaluate(run.effective_job_configs(), &jobs) {
                Advance::Schedule(stages) => {
                    for stage in stages {
                        self.dispatch_job(header, &run, stage).await?;
                    }
                    Ok(())
                }
                Advance::Finished => self.complete_run(run_id, OrtRunStatus::Finished).await,
                Advance::Failed => self.complete_run(run_id, OrtRunStatus::Failed).await,
            }
        }
        .instrument(telemetry::run_span(run_id))
        .await
    }

    /// Create the job for `stage` and send its request.
    ///
    /// The job is only marked `SCHEDULED` after the send succeeded. A failed
    /// send leaves it in `CREATED` for [`recover_pending`](Self::recover_pending).
    pub async fn dispatch_job(
        &self,
        header: &MessageHeader,
        run: &OrtRun,
        stage: Stage,
    ) -> Result<(), OrchestratorError> {
        let Some(configuration) = run.effective_job_configs().configuration_for(stage) else {
            tracing::debug!(%stage, "stage disabled for run");
            return Ok(());
        };

        let job = match self
            .store
            .create_job(run.id, configuration)
            .await
            .map_err(OrchestratorError::Store)?
        {
            JobCreation::Created(job) => job,
            JobCreation::Existing(job) => {
                tracing::debug!(%stage, job_id = %job.id, "job already exists");
                return Ok(());
            }
        };

        self.send_and_schedule(header, run, &job).await
    }

    async fn send_and_schedule(
        &self,
        header: &MessageHeader,
        run: &OrtRun,
        job: &Job,
    ) -> Result<(), OrchestratorError> {
        let stage = job.stage();
        self.senders.send_request(stage, header, job.id).await?;
        telemetry::record_job_scheduled(run.id, stage, job.id);

        match self
            .store
            .transition_job(job.id, JobStatus::Scheduled, Utc::now(), None)
            .await
            .map_err(OrchestratorError::Store)?
        {
            Transition::Applied(job) => telemetry::record_job_transition(&job),
            Transition::Rejected(current) => {
                // The worker already reported back.
                tracing::debug!(
                    job_id = %job.id,
                    status = %current.status,
                    "job moved on before scheduling"
                );
            }
            Transition::NotFound => return Err(OrchestratorError::UnknownJob { job_id: job.id }),
        }

        if run.status == OrtRunStatus::Created {
            match self
                .store
                .transition_run(run.id, OrtRunStatus::Active, Utc::now())
                .await
                .map_err(OrchestratorError::Store)?
            {
                Transition::Applied(_) => tracing::info!(run_id = %run.id, "run active"),
                Transition::Rejected(_) | Transition::NotFound => {}
            }
        }

        Ok(())
    }

    async fn complete_run(
        &self,
        run_id: RunId,
        status: OrtRunStatus,
    ) -> Result<(), OrchestratorError> {
        match self
            .store
            .transition_run(run_id, status, Utc::now())
            .await
            .map_err(OrchestratorError::Store)?
        {
            Transition::Applied(run) => telemetry::record_run_completed(run.id, run.status),
            Transition::Rejected(run) => {
                tracing::debug!(run_id = %run.id, status = %run.status, "run already completed");
            }
            Transition::NotFound => return Err(OrchestratorError::UnknownRun { run_id }),
        }
        Ok(())
    }

    /// Repair state left behind by an interrupted handler.
    ///
    /// Re-sends requests of jobs stuck in `CREATED` for longer than `grace`
    /// and re-evaluates open runs whose jobs are all terminal. Messages sent
    /// here carry a fresh header since the original one was not persisted.
    pub async fn recover_pending(
        &self,
        grace: Duration,
    ) -> Result<RecoveryReport, OrchestratorError> {
        let mut report = RecoveryReport::default();
        let Some(cutoff) = chrono::Duration::from_std(grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
        else {
            return Ok(report);
        };

        let stale = self
            .store
            .list_jobs(JobQuery {
                statuses: vec![JobStatus::Created],
                created_before: Some(cutoff),
                ..Default::default()
            })
            .await
            .map_err(OrchestratorError::Store)?;

        for job in stale {
            match self.resend_job(&job).await {
                Ok(true) => report.resent_jobs += 1,
                Ok(false) => {}
                Err(err) => {
                    report.failures += 1;
                    tracing::warn!(
                        job_id = %job.id,
                        stage = %job.stage(),
                        "recovery resend failed: {err}"
                    );
                }
            }
        }

        let open_runs = self
            .store
            .list_runs(RunQuery::with_statuses([
                OrtRunStatus::Created,
                OrtRunStatus::Active,
            ]))
            .await
            .map_err(OrchestratorError::Store)?;

        for run in open_runs {
            let jobs = self
                .store
                .get_jobs_for_run(run.id)
                .await
                .map_err(OrchestratorError::Store)?;

            let stalled = if jobs.is_empty() {
                run.created_at < cutoff
            } else {
                jobs.iter().all(Job::is_terminal)
            };
            if !stalled {
                continue;
            }

            match self.advance_run(&MessageHeader::generate(), run.id).await {
                Ok(()) => report.advanced_runs += 1,
                Err(err) => {
                    report.failures += 1;
                    tracing::warn!(run_id = %run.id, "recovery advance failed: {err}");
                }
            }
        }

        if report != RecoveryReport::default() {
            tracing::info!(
                resent_jobs = report.resent_jobs,
                advanced_runs = report.advanced_runs,
                failures = report.failures,
                "recovery sweep completed"
            );
        }

        Ok(report)
    }

    async fn resend_job(&self, job: &Job) -> Result<bool, OrchestratorError> {
        let run = self
            .store
            .get_run(job.ort_run_id)
            .await
            .map_err(OrchestratorError::Store)?
            .ok_or(OrchestratorError::UnknownRun {
                run_id: job.ort_run_id,
            })?;

        if run.status.is_terminal() {
            return Ok(false);
        }

        tracing::info!(
            job_id = %job.id,
            stage = %job.stage(),
            "re-sending request of stale job"
        );
        self.send_and_schedule(&MessageHeader::generate(), &run, job)
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl EndpointHandler<OrchestratorEndpoint> for Orchestrator {
    async fn handle(&self, message: Message<OrchestratorMessage>) -> anyhow::Result<()> {
        let kind = message.payload.kind();
        let trace_id = message.header.trace_id.clone();

        match self.handle_message(message).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_retryable() => Err(err.into()),
            Err(err) => {
                // Redelivery cannot repair a message that contradicts the store.
                tracing::error!(%trace_id, kind, "dropping message: {err}");
                Ok(())
            }
        }
    }
}
