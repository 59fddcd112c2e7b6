use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ortflow::*;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// [`RunStore`] backed by in-process maps.
///
/// Applies the same transition rules as the Postgres store through
/// [`Job::apply_transition`] and [`OrtRun::apply_transition`].
#[derive(Clone, Default)]
pub struct InMemoryRunStore {
    state: Arc<Mutex<StoreState>>,
}

#[derive(Default)]
struct StoreState {
    runs: BTreeMap<RunId, OrtRun>,
    jobs: BTreeMap<JobId, Job>,
    next_run_id: i64,
    next_job_id: i64,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.state.lock().runs.len()
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Overwrite a job's creation time, e.g. to make it look stale to the
    /// recovery sweep.
    pub fn backdate_job(&self, id: JobId, created_at: DateTime<Utc>) {
        if let Some(job) = self.state.lock().jobs.get_mut(&id) {
            job.created_at = created_at;
        }
    }

    /// Overwrite a run's creation time.
    pub fn backdate_run(&self, id: RunId, created_at: DateTime<Utc>) {
        if let Some(run) = self.state.lock().runs.get_mut(&id) {
            run.created_at = created_at;
        }
    }

    pub fn assert_job_count_eq(&self, expected: usize) {
        let actual = self.job_count();
        assert_eq!(actual, expected, "Expected {expected} jobs, got {actual}");
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, run: NewOrtRun) -> anyhow::Result<OrtRun> {
        let mut state = self.state.lock();

        if let Some(existing) = state
            .runs
            .values()
            .find(|existing| existing.request_id == run.request_id)
        {
            return Ok(existing.clone());
        }

        state.next_run_id += 1;
        let id = RunId(state.next_run_id);
        let index = state
            .runs
            .values()
            .filter(|existing| existing.repository_id == run.repository_id)
            .count() as i64
            + 1;

        let created = OrtRun {
            id,
            index,
            repository_id: run.repository_id,
            revision: run.revision,
            created_at: Utc::now(),
            finished_at: None,
            job_configs: run.job_configs,
            resolved_job_configs: None,
            job_config_context: run.job_config_context,
            labels: run.labels,
            status: OrtRunStatus::Created,
            request_id: run.request_id,
        };
        state.runs.insert(id, created.clone());
        Ok(created)
    }

    async fn get_run(&self, id: RunId) -> anyhow::Result<Option<OrtRun>> {
        Ok(self.state.lock().runs.get(&id).cloned())
    }

    async fn list_runs(&self, query: RunQuery) -> anyhow::Result<Vec<OrtRun>> {
        let state = self.state.lock();
        Ok(state
            .runs
            .values()
            .filter(|run| query.matches(run))
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn update_run(&self, id: RunId, update: RunUpdate) -> anyhow::Result<Option<OrtRun>> {
        let mut state = self.state.lock();
        let Some(run) = state.runs.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(resolved) = update.resolved_job_configs {
            run.resolved_job_configs = Some(resolved);
        }
        if let Some(labels) = update.labels {
            run.labels = labels;
        }
        Ok(Some(run.clone()))
    }

    async fn transition_run(
        &self,
        id: RunId,
        status: OrtRunStatus,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Transition<OrtRun>> {
        let mut state = self.state.lock();
        let Some(run) = state.runs.get_mut(&id) else {
            return Ok(Transition::NotFound);
        };
        if run.apply_transition(status, at) {
            Ok(Transition::Applied(run.clone()))
        } else {
            Ok(Transition::Rejected(run.clone()))
        }
    }

    async fn create_job(
        &self,
        run_id: RunId,
        configuration: StageConfiguration,
    ) -> anyhow::Result<JobCreation> {
        let mut state = self.state.lock();
        if !state.runs.contains_key(&run_id) {
            anyhow::bail!("run {} not found", run_id);
        }

        let stage = configuration.stage();
        if let Some(existing) = state
            .jobs
            .values()
            .find(|job| job.ort_run_id == run_id && job.stage() == stage)
        {
            return Ok(JobCreation::Existing(existing.clone()));
        }

        state.next_job_id += 1;
        let job = Job {
            id: JobId(state.next_job_id),
            ort_run_id: run_id,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: JobStatus::Created,
            error_message: None,
            configuration,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(JobCreation::Created(job))
    }

    async fn get_job(&self, id: JobId) -> anyhow::Result<Option<Job>> {
        Ok(self.state.lock().jobs.get(&id).cloned())
    }

    async fn get_job_for_run(&self, run_id: RunId, stage: Stage) -> anyhow::Result<Option<Job>> {
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .find(|job| job.ort_run_id == run_id && job.stage() == stage)
            .cloned())
    }

    async fn get_jobs_for_run(&self, run_id: RunId) -> anyhow::Result<Vec<Job>> {
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .filter(|job| job.ort_run_id == run_id)
            .cloned()
            .collect())
    }

    async fn list_jobs(&self, query: JobQuery) -> anyhow::Result<Vec<Job>> {
        let state = self.state.lock();
        Ok(state
            .jobs
            .values()
            .filter(|job| query.matches(job))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn transition_job(
        &self,
        id: JobId,
        status: JobStatus,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> anyhow::Result<Transition<Job>> {
        let mut state = self.state.lock();
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(Transition::NotFound);
        };
        if job.apply_transition(status, at, error) {
            Ok(Transition::Applied(job.clone()))
        } else {
            Ok(Transition::Rejected(job.clone()))
        }
    }
}
