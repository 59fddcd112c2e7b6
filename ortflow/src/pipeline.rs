//! Stage-advance evaluation.
//!
//! Everything here is a pure function of the run's configuration and the
//! persisted job records, so any orchestrator replica can recompute the next
//! step after a restart without in-memory state.

use std::collections::HashMap;

use crate::job::{Job, JobStatus};
use crate::stage::{JobConfigurations, Stage};

/// What the orchestrator should do next for a run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Advance {
    /// Create and dispatch jobs for these stages. Empty while work is in
    /// flight.
    Schedule(Vec<Stage>),
    /// Every enabled stage has a finished job.
    Finished,
    /// A job failed and no job of the run is still active.
    Failed,
}

/// Snapshot of a run's jobs keyed by stage.
pub struct PipelineState<'a> {
    configs: &'a JobConfigurations,
    statuses: HashMap<Stage, JobStatus>,
}

impl<'a> PipelineState<'a> {
    pub fn new(configs: &'a JobConfigurations, jobs: &[Job]) -> Self {
        let mut statuses = HashMap::with_capacity(jobs.len());
        for job in jobs {
            // A non-terminal record wins so an active job is never hidden.
            statuses
                .entry(job.stage())
                .and_modify(|current: &mut JobStatus| {
                    if current.is_terminal() {
                        *current = job.status;
                    }
                })
                .or_insert(job.status);
        }
        Self { configs, statuses }
    }

    pub fn status(&self, stage: Stage) -> Option<JobStatus> {
        self.statuses.get(&stage).copied()
    }

    /// A stage is satisfied once its job finished, or when it is disabled
    /// and everything it depends on is satisfied.
    pub fn is_satisfied(&self, stage: Stage) -> bool {
        if self.configs.is_enabled(stage) {
            self.status(stage) == Some(JobStatus::Finished)
        } else {
            self.prerequisites_satisfied(stage)
        }
    }

    pub fn prerequisites_satisfied(&self, stage: Stage) -> bool {
        stage
            .prerequisites()
            .iter()
            .all(|prerequisite| self.is_satisfied(*prerequisite))
    }

    pub fn has_failed_job(&self) -> bool {
        self.statuses.values().any(|s| *s == JobStatus::Failed)
    }

    pub fn has_active_job(&self) -> bool {
        self.statuses.values().any(|s| !s.is_terminal())
    }

    /// Enabled stages without a job whose prerequisites are all satisfied.
    pub fn eligible_stages(&self) -> Vec<Stage> {
        self.configs
            .enabled_stages()
            .filter(|stage| self.status(*stage).is_none())
            .filter(|stage| self.prerequisites_satisfied(*stage))
            .collect()
    }

    pub fn advance(&self) -> Advance {
        if self.has_failed_job() {
            return if self.has_active_job() {
                Advance::Schedule(Vec::new())
            } else {
                Advance::Failed
            };
        }

        let all_finished = self
            .configs
            .enabled_stages()
            .all(|stage| self.status(stage) == Some(JobStatus::Finished));
        if all_finished {
            return Advance::Finished;
        }

        Advance::Schedule(self.eligible_stages())
    }
}

/// Compute the next step for a run from its configuration and jobs.
pub fn evaluate(configs: &JobConfigurations, jobs: &[Job]) -> Advance {
    PipelineState::new(configs, jobs).advance()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, RunId};
    use crate::stage::{
        AdvisorJobConfiguration, EvaluatorJobConfiguration, ReporterJobConfiguration,
        ScannerJobConfiguration,
    };
    use chrono::Utc;

    fn configs(advisor: bool, scanner: bool, evaluator: bool, reporter: bool) -> JobConfigurations {
        JobConfigurations {
            advisor: advisor.then(AdvisorJobConfiguration::default),
            scanner: scanner.then(ScannerJobConfiguration::default),
            evaluator: evaluator.then(EvaluatorJobConfiguration::default),
            reporter: reporter.then(ReporterJobConfiguration::default),
            ..Default::default()
        }
    }

    fn job(configs: &JobConfigurations, stage: Stage, status: JobStatus) -> Job {
        Job {
            id: JobId(stage as i64 + 1),
            ort_run_id: RunId(1),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status,
            error_message: None,
            configuration: configs.configuration_for(stage).unwrap(),
        }
    }

    #[test]
    fn test_new_run_schedules_only_analyzer() {
        let configs = configs(true, true, true, true);
        assert_eq!(evaluate(&configs, &[]), Advance::Schedule(vec![Stage::Analyzer]));
    }

    #[test]
    fn test_analyzer_result_fans_out_to_advisor_and_scanner() {
        let configs = configs(true, true, true, false);
        let jobs = [job(&configs, Stage::Analyzer, JobStatus::Finished)];

        assert_eq!(
            evaluate(&configs, &jobs),
            Advance::Schedule(vec![Stage::Advisor, Stage::Scanner])
        );
    }

    #[test]
    fn test_evaluator_waits_for_join() {
        let configs = configs(true, true, true, false);
        let mut jobs = vec![
            job(&configs, Stage::Analyzer, JobStatus::Finished),
            job(&configs, Stage::Advisor, JobStatus::Finished),
            job(&configs, Stage::Scanner, JobStatus::Scheduled),
        ];
        assert_eq!(evaluate(&configs, &jobs), Advance::Schedule(vec![]));

        jobs[2].status = JobStatus::Finished;
        assert_eq!(evaluate(&configs, &jobs), Advance::Schedule(vec![Stage::Evaluator]));
    }

    #[test]
    fn test_disabled_advisor_counts_as_satisfied() {
        let configs = configs(false, true, true, false);
        let jobs = [
            job(&configs, Stage::Analyzer, JobStatus::Finished),
            job(&configs, Stage::Scanner, JobStatus::Finished),
        ];

        assert_eq!(evaluate(&configs, &jobs), Advance::Schedule(vec![Stage::Evaluator]));
    }

    #[test]
    fn test_reporter_follows_join_when_evaluator_disabled() {
        let configs = configs(true, true, false, true);
        let state_jobs = [
            job(&configs, Stage::Analyzer, JobStatus::Finished),
            job(&configs, Stage::Advisor, JobStatus::Finished),
            job(&configs, Stage::Scanner, JobStatus::Running),
        ];
        let state = PipelineState::new(&configs, &state_jobs);
        assert!(!state.is_satisfied(Stage::Evaluator));
        assert_eq!(state.advance(), Advance::Schedule(vec![]));

        let done = [
            job(&configs, Stage::Analyzer, JobStatus::Finished),
            job(&configs, Stage::Advisor, JobStatus::Finished),
            job(&configs, Stage::Scanner, JobStatus::Finished),
        ];
        assert_eq!(evaluate(&configs, &done), Advance::Schedule(vec![Stage::Reporter]));
    }

    #[test]
    fn test_analyzer_only_run_finishes() {
        let configs = configs(false, false, false, false);
        let jobs = [job(&configs, Stage::Analyzer, JobStatus::Finished)];
        assert_eq!(evaluate(&configs, &jobs), Advance::Finished);
    }

    #[test]
    fn test_analyzer_failure_fails_run_immediately() {
        let configs = configs(true, true, true, true);
        let jobs = [job(&configs, Stage::Analyzer, JobStatus::Failed)];
        assert_eq!(evaluate(&configs, &jobs), Advance::Failed);
    }

    #[test]
    fn test_failure_waits_for_active_sibling() {
        let configs = configs(true, true, true, false);
        let mut jobs = vec![
            job(&configs, Stage::Analyzer, JobStatus::Finished),
            job(&configs, Stage::Advisor, JobStatus::Scheduled),
            job(&configs, Stage::Scanner, JobStatus::Failed),
        ];
        assert_eq!(evaluate(&configs, &jobs), Advance::Schedule(vec![]));

        jobs[1].status = JobStatus::Finished;
        assert_eq!(evaluate(&configs, &jobs), Advance::Failed);
    }

    #[test]
    fn test_existing_jobs_are_not_rescheduled() {
        let configs = configs(true, true, false, false);
        let jobs = [
            job(&configs, Stage::Analyzer, JobStatus::Finished),
            job(&configs, Stage::Advisor, JobStatus::Created),
        ];
        assert_eq!(evaluate(&configs, &jobs), Advance::Schedule(vec![Stage::Scanner]));
    }
}
