//! Tracing and telemetry instrumentation for ortflow.
//!
//! Span constructors carry the correlation fields (`trace_id`, `run_id`,
//! `job_id`, `stage`) that tie log lines of one run together across
//! services. The `record_*` helpers emit a structured event and, with the
//! `metrics` feature, bump the matching Prometheus series.
//!
//! # Example
//!
//! ```ignore
//! use ortflow::telemetry::{message_span, record_job_scheduled};
//!
//! let span = message_span(EndpointName::Orchestrator, &header, "CreateOrtRun");
//! async { /* handle */ }.instrument(span).await;
//! ```

use std::future::Future;

use tracing::{Instrument, Span, info_span};

use crate::job::{Job, JobId, JobStatus, RunId};
use crate::message::MessageHeader;
use crate::run::OrtRunStatus;
use crate::stage::Stage;
use crate::transport::EndpointName;

/// Span for handling one received message.
#[must_use]
pub fn message_span(endpoint: EndpointName, header: &MessageHeader, kind: &str) -> Span {
    info_span!(
        "ortflow.message",
        endpoint = %endpoint,
        trace_id = %header.trace_id,
        kind = %kind,
    )
}

/// Span for work on one run, e.g. advancing its pipeline.
#[must_use]
pub fn run_span(run_id: RunId) -> Span {
    info_span!("ortflow.run", run_id = %run_id)
}

/// Span for work on one job.
#[must_use]
pub fn job_span(stage: Stage, job_id: JobId) -> Span {
    info_span!("ortflow.job", stage = %stage, job_id = %job_id)
}

/// Span for the monitor's handling of one Kubernetes Job.
#[must_use]
pub fn workload_span(name: &str) -> Span {
    info_span!("ortflow.monitor", workload = %name)
}

/// Instrument a future with a [`message_span`].
pub fn instrument_message<F>(
    endpoint: EndpointName,
    header: &MessageHeader,
    kind: &str,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(message_span(endpoint, header, kind))
}

/// A stage request was sent to a worker.
pub fn record_job_scheduled(run_id: RunId, stage: Stage, job_id: JobId) {
    tracing::info!(
        run_id = %run_id,
        stage = %stage,
        job_id = %job_id,
        "job scheduled"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_scheduled(stage.as_str());
}

/// A job reached a new status through the orchestrator.
pub fn record_job_transition(job: &Job) {
    let stage = job.stage();
    let duration_secs = job
        .duration()
        .and_then(|d| d.to_std().ok())
        .map(|d| d.as_secs_f64());

    match job.status {
        JobStatus::Failed => tracing::warn!(
            run_id = %job.ort_run_id,
            stage = %stage,
            job_id = %job.id,
            status = %job.status,
            error = job.error_message.as_deref().unwrap_or(""),
            "job failed"
        ),
        status => tracing::info!(
            run_id = %job.ort_run_id,
            stage = %stage,
            job_id = %job.id,
            status = %status,
            duration_secs = duration_secs,
            "job status changed"
        ),
    }

    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_job_transition(stage.as_str(), job.status.as_str());
        if let Some(secs) = duration_secs {
            crate::metrics::observe_job_duration(stage.as_str(), job.status.as_str(), secs);
        }
    }
}

/// A run reached a terminal status.
pub fn record_run_completed(run_id: RunId, status: OrtRunStatus) {
    tracing::info!(run_id = %run_id, status = %status, "run completed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_completed(status.as_str());
}

/// A worker report arrived for a job that was already terminal.
pub fn record_duplicate_delivery(stage: Stage, job_id: JobId, status: JobStatus) {
    tracing::info!(
        stage = %stage,
        job_id = %job_id,
        status = %status,
        "ignoring report for terminal job"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_duplicate_delivery(stage.as_str());
}

/// A backend failed to send a message.
pub fn record_send_failure(endpoint: EndpointName, error: &anyhow::Error) {
    tracing::error!(endpoint = %endpoint, "send failed: {error:#}");

    #[cfg(feature = "metrics")]
    crate::metrics::record_send_failure(endpoint.as_str());
}

/// The job monitor reported an outcome to the orchestrator.
pub fn record_monitor_report(stage: Stage, job_id: JobId, outcome: &str) {
    tracing::info!(
        stage = %stage,
        job_id = %job_id,
        outcome = %outcome,
        "reported workload outcome"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_monitor_report(stage.as_str(), outcome);
}
