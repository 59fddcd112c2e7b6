use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::stage::{Stage, StageConfiguration};

macro_rules! store_id {
    ($name:ident) => {
        #[derive(
            Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

store_id!(JobId);
store_id!(RunId);
store_id!(RepositoryId);

/// Lifecycle of a single stage execution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Scheduled,
    Running,
    Finished,
    Failed,
}

impl JobStatus {
    pub const NON_TERMINAL: [JobStatus; 3] =
        [JobStatus::Created, JobStatus::Scheduled, JobStatus::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Running => "RUNNING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATED" => Some(JobStatus::Created),
            "SCHEDULED" => Some(JobStatus::Scheduled),
            "RUNNING" => Some(JobStatus::Running),
            "FINISHED" => Some(JobStatus::Finished),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }

    /// Statuses a job may be in for a move to `self` to be accepted.
    pub fn allowed_predecessors(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Created => &[],
            JobStatus::Scheduled => &[JobStatus::Created],
            JobStatus::Running => &[JobStatus::Created, JobStatus::Scheduled],
            JobStatus::Finished | JobStatus::Failed => &JobStatus::NON_TERMINAL,
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        next.allowed_predecessors().contains(self)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage execution within a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub ort_run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub configuration: StageConfiguration,
}

impl Job {
    pub fn stage(&self) -> Stage {
        self.configuration.stage()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status change to this record, stamping timestamps.
    ///
    /// Returns `false` and leaves the job untouched when the current status
    /// does not allow the move. Store implementations share this so the
    /// in-memory and SQL variants stamp the same fields.
    pub fn apply_transition(
        &mut self,
        status: JobStatus,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }

        match status {
            JobStatus::Scheduled | JobStatus::Running => {
                self.started_at.get_or_insert(at);
            }
            JobStatus::Finished | JobStatus::Failed => {
                self.finished_at = Some(at);
                self.error_message = error;
            }
            JobStatus::Created => {}
        }
        self.status = status;
        true
    }

    /// Wall-clock time between scheduling and completion, if both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::AnalyzerJobConfiguration;

    fn job(status: JobStatus) -> Job {
        Job {
            id: JobId(1),
            ort_run_id: RunId(7),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status,
            error_message: None,
            configuration: StageConfiguration::Analyzer(AnalyzerJobConfiguration::default()),
        }
    }

    #[test]
    fn test_terminal_statuses_reject_every_transition() {
        for terminal in [JobStatus::Finished, JobStatus::Failed] {
            for next in [
                JobStatus::Created,
                JobStatus::Scheduled,
                JobStatus::Running,
                JobStatus::Finished,
                JobStatus::Failed,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_scheduled_cannot_regress_to_created() {
        assert!(!JobStatus::Scheduled.can_transition_to(JobStatus::Created));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Scheduled));
        assert!(JobStatus::Created.can_transition_to(JobStatus::Finished));
    }

    #[test]
    fn test_apply_transition_stamps_timestamps() {
        let mut job = job(JobStatus::Created);
        let scheduled_at = Utc::now();
        assert!(job.apply_transition(JobStatus::Scheduled, scheduled_at, None));
        assert_eq!(job.started_at, Some(scheduled_at));

        let running_at = scheduled_at + chrono::Duration::seconds(5);
        assert!(job.apply_transition(JobStatus::Running, running_at, None));
        assert_eq!(job.started_at, Some(scheduled_at), "start time is kept");

        let failed_at = running_at + chrono::Duration::seconds(5);
        assert!(job.apply_transition(JobStatus::Failed, failed_at, Some("boom".into())));
        assert_eq!(job.finished_at, Some(failed_at));
        assert_eq!(job.error_message.as_deref(), Some("boom"));
        assert_eq!(job.duration(), Some(chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_apply_transition_rejects_terminal_overwrite() {
        let mut job = job(JobStatus::Finished);
        assert!(!job.apply_transition(JobStatus::Scheduled, Utc::now(), None));
        assert_eq!(job.status, JobStatus::Finished);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            JobStatus::Created,
            JobStatus::Scheduled,
            JobStatus::Running,
            JobStatus::Finished,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("UNKNOWN"), None);
    }
}
