//! Reading ortflow metadata and outcomes off Kubernetes Jobs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;

use crate::job::JobId;
use crate::message::{MessageHeader, OrchestratorMessage};
use crate::stage::Stage;
use crate::transport::kubernetes::{JOB_ID_LABEL, TOKEN_VAR, TRACE_ID_VAR, WORKER_LABEL};

/// Terminal state of a Kubernetes Job as seen by the monitor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed { reason: String },
    /// No terminal state within the configured timeout.
    TimedOut { after: Duration },
    /// Removed from the cluster without reaching a terminal state.
    Deleted,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed { .. } => "failed",
            JobOutcome::TimedOut { .. } => "timed_out",
            JobOutcome::Deleted => "deleted",
        }
    }

    /// The failure cause reported to the orchestrator, `None` on success.
    pub fn error_message(&self) -> Option<String> {
        match self {
            JobOutcome::Completed => None,
            JobOutcome::Failed { reason } => Some(reason.clone()),
            JobOutcome::TimedOut { after } => {
                Some(format!("job timed out after {}s", after.as_secs()))
            }
            JobOutcome::Deleted => Some("job deleted before completion".to_string()),
        }
    }

    /// The orchestrator message reporting this outcome.
    pub fn to_message(&self, stage: Stage, job_id: JobId) -> OrchestratorMessage {
        match self.error_message() {
            None => OrchestratorMessage::worker_result(stage, job_id),
            error => OrchestratorMessage::worker_error(stage, job_id, error),
        }
    }
}

/// The ortflow identity of a Kubernetes Job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObservedJob {
    /// Kubernetes UID, falling back to the name.
    pub uid: String,
    pub name: String,
    pub stage: Stage,
    pub job_id: JobId,
    pub header: MessageHeader,
    pub created_at: Option<DateTime<Utc>>,
}

/// Extract the stage, job id and header of a Job created by the Kubernetes
/// transport. Returns `None` for Jobs without usable ortflow labels.
pub fn observe(job: &Job) -> Option<ObservedJob> {
    let labels = job.metadata.labels.as_ref()?;
    let stage = Stage::from_name(labels.get(WORKER_LABEL)?)?;
    let job_id = labels.get(JOB_ID_LABEL)?.parse::<i64>().ok()?;
    let name = job.metadata.name.clone()?;

    Some(ObservedJob {
        uid: job.metadata.uid.clone().unwrap_or_else(|| name.clone()),
        name,
        stage,
        job_id: JobId(job_id),
        header: header_from_template(job),
        created_at: job.metadata.creation_timestamp.as_ref().map(|t| t.0),
    })
}

/// The message header passed to the Job's container, or an empty token and a
/// fresh trace id when the environment does not carry one.
pub fn header_from_template(job: &Job) -> MessageHeader {
    let env_value = |name: &str| {
        job.spec
            .as_ref()?
            .template
            .spec
            .as_ref()?
            .containers
            .iter()
            .flat_map(|container| container.env.iter().flatten())
            .find(|var| var.name == name)
            .and_then(|var| var.value.clone())
    };

    let mut header = MessageHeader::generate();
    if let Some(token) = env_value(TOKEN_VAR) {
        header.token = token;
    }
    if let Some(trace_id) = env_value(TRACE_ID_VAR).filter(|id| !id.is_empty()) {
        header.trace_id = trace_id;
    }
    header
}

fn condition_is_true(job: &Job, kind: &str) -> Option<(Option<String>, Option<String>)> {
    job.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|condition| condition.type_ == kind && condition.status == "True")
        .map(|condition| (condition.reason.clone(), condition.message.clone()))
}

/// When the Job reached its terminal state: the completion time, or the
/// transition time of its `Complete` or `Failed` condition.
pub fn finished_at(job: &Job) -> Option<DateTime<Utc>> {
    let status = job.status.as_ref()?;
    if let Some(time) = &status.completion_time {
        return Some(time.0);
    }

    status
        .conditions
        .as_ref()?
        .iter()
        .filter(|condition| {
            matches!(condition.type_.as_str(), "Complete" | "Failed") && condition.status == "True"
        })
        .find_map(|condition| condition.last_transition_time.as_ref().map(|time| time.0))
}

/// Classify a Job from its native status.
///
/// Returns `None` while the Job is still running and within `timeout` of
/// its creation.
pub fn classify(job: &Job, now: DateTime<Utc>, timeout: Duration) -> Option<JobOutcome> {
    let succeeded = job
        .status
        .as_ref()
        .and_then(|status| status.succeeded)
        .unwrap_or(0);

    if condition_is_true(job, "Complete").is_some() || succeeded > 0 {
        return Some(JobOutcome::Completed);
    }

    if let Some((reason, message)) = condition_is_true(job, "Failed") {
        let reason = match (reason, message) {
            (Some(reason), Some(message)) => format!("{reason}: {message}"),
            (Some(text), None) | (None, Some(text)) => text,
            (None, None) => "job failed".to_string(),
        };
        return Some(JobOutcome::Failed { reason });
    }

    let created = job.metadata.creation_timestamp.as_ref()?.0;
    let age = (now - created).to_std().ok()?;
    (age > timeout).then_some(JobOutcome::TimedOut { after: timeout })
}
