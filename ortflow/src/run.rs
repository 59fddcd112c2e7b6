use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{RepositoryId, RunId};
use crate::stage::JobConfigurations;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrtRunStatus {
    Created,
    Active,
    Finished,
    Failed,
}

impl OrtRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrtRunStatus::Created => "CREATED",
            OrtRunStatus::Active => "ACTIVE",
            OrtRunStatus::Finished => "FINISHED",
            OrtRunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATED" => Some(OrtRunStatus::Created),
            "ACTIVE" => Some(OrtRunStatus::Active),
            "FINISHED" => Some(OrtRunStatus::Finished),
            "FAILED" => Some(OrtRunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrtRunStatus::Finished | OrtRunStatus::Failed)
    }

    pub fn allowed_predecessors(&self) -> &'static [OrtRunStatus] {
        match self {
            OrtRunStatus::Created => &[],
            OrtRunStatus::Active => &[OrtRunStatus::Created],
            OrtRunStatus::Finished | OrtRunStatus::Failed => {
                &[OrtRunStatus::Created, OrtRunStatus::Active]
            }
        }
    }

    pub fn can_transition_to(&self, next: OrtRunStatus) -> bool {
        next.allowed_predecessors().contains(self)
    }
}

impl std::fmt::Display for OrtRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pipeline execution over a repository revision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrtRun {
    pub id: RunId,
    /// Per-repository sequence number, starting at 1.
    pub index: i64,
    pub repository_id: RepositoryId,
    pub revision: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub job_configs: JobConfigurations,
    pub resolved_job_configs: Option<JobConfigurations>,
    pub job_config_context: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub status: OrtRunStatus,
    pub request_id: Uuid,
}

impl OrtRun {
    /// The configuration that drives scheduling: the resolved snapshot when
    /// one was written, the submitted configuration otherwise.
    pub fn effective_job_configs(&self) -> &JobConfigurations {
        self.resolved_job_configs.as_ref().unwrap_or(&self.job_configs)
    }

    /// Apply a status change, stamping `finished_at` on terminal states.
    pub fn apply_transition(&mut self, status: OrtRunStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        if status.is_terminal() {
            self.finished_at = Some(at);
        }
        self.status = status;
        true
    }
}

/// Input for [`RunStore::create_run`](crate::store::RunStore::create_run).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrtRun {
    pub request_id: Uuid,
    pub repository_id: RepositoryId,
    pub revision: String,
    pub job_configs: JobConfigurations,
    pub job_config_context: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// Partial update of a run; `None` fields are left unchanged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunUpdate {
    pub resolved_job_configs: Option<JobConfigurations>,
    pub labels: Option<BTreeMap<String, String>>,
}
