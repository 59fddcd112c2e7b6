use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::{Job, JobId, JobStatus, RepositoryId, RunId};
use crate::run::{NewOrtRun, OrtRun, OrtRunStatus, RunUpdate};
use crate::stage::{Stage, StageConfiguration};

/// Outcome of a compare-and-transition on a stored entity.
#[derive(Clone, Debug, PartialEq)]
pub enum Transition<T> {
    /// The status changed; carries the updated entity.
    Applied(T),
    /// The current status does not allow the move; carries the unchanged entity.
    Rejected(T),
    NotFound,
}

impl<T> Transition<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn into_inner(self) -> Option<T> {
        match self {
            Transition::Applied(value) | Transition::Rejected(value) => Some(value),
            Transition::NotFound => None,
        }
    }
}

/// Outcome of [`RunStore::create_job`].
#[derive(Clone, Debug, PartialEq)]
pub enum JobCreation {
    Created(Job),
    /// A job for this (run, stage) already existed; nothing was written.
    Existing(Job),
}

impl JobCreation {
    pub fn job(&self) -> &Job {
        match self {
            JobCreation::Created(job) | JobCreation::Existing(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            JobCreation::Created(job) | JobCreation::Existing(job) => job,
        }
    }
}

/// Filters for [`RunStore::list_runs`].
#[derive(Clone, Debug, Default)]
pub struct RunQuery {
    pub repository_id: Option<RepositoryId>,
    /// Empty means any status.
    pub statuses: Vec<OrtRunStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl RunQuery {
    pub fn with_statuses(statuses: impl IntoIterator<Item = OrtRunStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn matches(&self, run: &OrtRun) -> bool {
        self.repository_id.is_none_or(|repo| run.repository_id == repo)
            && (self.statuses.is_empty() || self.statuses.contains(&run.status))
    }
}

/// Filters for [`RunStore::list_jobs`].
#[derive(Clone, Debug, Default)]
pub struct JobQuery {
    pub stage: Option<Stage>,
    /// Empty means any status.
    pub statuses: Vec<JobStatus>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobQuery {
    pub fn matches(&self, job: &Job) -> bool {
        self.stage.is_none_or(|stage| job.stage() == stage)
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.created_before.is_none_or(|before| job.created_at < before)
    }
}

/// Durable run and job state.
///
/// The store is the single source of truth for the orchestrator. Status
/// changes go through the `transition_*` operations, which apply atomically
/// only when the current status permits the move, so concurrent or
/// duplicated message handling cannot regress a record.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a new run in `CREATED`.
    ///
    /// Returns the existing run unchanged if one with the same request id
    /// was created before.
    async fn create_run(&self, run: NewOrtRun) -> anyhow::Result<OrtRun>;

    async fn get_run(&self, id: RunId) -> anyhow::Result<Option<OrtRun>>;

    /// Runs matching the query, ordered by id.
    async fn list_runs(&self, query: RunQuery) -> anyhow::Result<Vec<OrtRun>>;

    /// Apply a partial update. Returns `None` for an unknown run.
    async fn update_run(&self, id: RunId, update: RunUpdate) -> anyhow::Result<Option<OrtRun>>;

    async fn transition_run(
        &self,
        id: RunId,
        status: OrtRunStatus,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Transition<OrtRun>>;

    /// Create the job for the configuration's stage in `CREATED`.
    ///
    /// At most one job per (run, stage) ever exists; a second call returns
    /// [`JobCreation::Existing`].
    async fn create_job(
        &self,
        run_id: RunId,
        configuration: StageConfiguration,
    ) -> anyhow::Result<JobCreation>;

    async fn get_job(&self, id: JobId) -> anyhow::Result<Option<Job>>;

    async fn get_job_for_run(&self, run_id: RunId, stage: Stage) -> anyhow::Result<Option<Job>>;

    async fn get_jobs_for_run(&self, run_id: RunId) -> anyhow::Result<Vec<Job>>;

    /// Jobs matching the query, ordered by id.
    async fn list_jobs(&self, query: JobQuery) -> anyhow::Result<Vec<Job>>;

    async fn transition_job(
        &self,
        id: JobId,
        status: JobStatus,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> anyhow::Result<Transition<Job>>;
}
