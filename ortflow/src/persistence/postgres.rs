use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::config::PersistenceConfig;
use crate::job::{Job, JobId, JobStatus, RepositoryId, RunId};
use crate::run::{NewOrtRun, OrtRun, OrtRunStatus, RunUpdate};
use crate::stage::{JobConfigurations, Stage, StageConfiguration};
use crate::store::{JobCreation, JobQuery, RunQuery, RunStore, Transition};

const RUN_COLUMNS: &str = "id, request_id, repository_id, run_index, revision, created_at, \
     finished_at, job_configs, resolved_job_configs, job_config_context, labels, status";

const JOB_COLUMNS: &str =
    "id, ort_run_id, created_at, started_at, finished_at, status, error_message, configuration";

/// PostgreSQL-backed [`RunStore`].
///
/// Runs and jobs live in `ortflow_runs` and `ortflow_jobs`. Uniqueness of
/// request ids and of (run, stage) pairs is enforced by indexes. Status
/// changes are single `UPDATE`s guarded by the allowed predecessor statuses.
#[derive(Debug, Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool sized by `config`.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    async fn find_run_by_request(&self, request_id: uuid::Uuid) -> anyhow::Result<Option<OrtRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM ortflow_runs WHERE request_id = $1");
        let row = sqlx::query(&sql)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }
}

fn run_from_row(row: &PgRow) -> anyhow::Result<OrtRun> {
    let status: String = row.try_get("status")?;
    let status = OrtRunStatus::parse(&status)
        .ok_or_else(|| anyhow::anyhow!("invalid run status: {}", status))?;
    let Json(job_configs): Json<JobConfigurations> = row.try_get("job_configs")?;
    let resolved: Option<Json<JobConfigurations>> = row.try_get("resolved_job_configs")?;
    let Json(labels): Json<BTreeMap<String, String>> = row.try_get("labels")?;

    Ok(OrtRun {
        id: RunId(row.try_get("id")?),
        index: row.try_get("run_index")?,
        repository_id: RepositoryId(row.try_get("repository_id")?),
        revision: row.try_get("revision")?,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
        job_configs,
        resolved_job_configs: resolved.map(|json| json.0),
        job_config_context: row.try_get("job_config_context")?,
        labels,
        status,
        request_id: row.try_get("request_id")?,
    })
}

fn job_from_row(row: &PgRow) -> anyhow::Result<Job> {
    let status: String = row.try_get("status")?;
    let status = JobStatus::parse(&status)
        .ok_or_else(|| anyhow::anyhow!("invalid job status: {}", status))?;
    let Json(configuration): Json<StageConfiguration> = row.try_get("configuration")?;

    Ok(Job {
        id: JobId(row.try_get("id")?),
        ort_run_id: RunId(row.try_get("ort_run_id")?),
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status,
        error_message: row.try_get("error_message")?,
        configuration,
    })
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23503"))
}

fn limit_param(limit: Option<usize>) -> Option<i64> {
    limit.map(|limit| i64::try_from(limit).unwrap_or(i64::MAX))
}

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn create_run(&self, run: NewOrtRun) -> anyhow::Result<OrtRun> {
        if let Some(existing) = self.find_run_by_request(run.request_id).await? {
            debug!(run_id = %existing.id, request_id = %run.request_id, "run already exists");
            return Ok(existing);
        }

        let mut tx = self.pool.begin().await?;

        // Serializes index allocation per repository.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(run.repository_id.get())
            .execute(&mut *tx)
            .await?;

        let next_index: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(run_index), 0) + 1
            FROM ortflow_runs
            WHERE repository_id = $1
            "#,
        )
        .bind(run.repository_id.get())
        .fetch_one(&mut *tx)
        .await?;

        let sql = format!(
            r#"
            INSERT INTO ortflow_runs (
                request_id, repository_id, run_index, revision, created_at,
                job_configs, job_config_context, labels, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (request_id) DO NOTHING
            RETURNING {RUN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(run.request_id)
            .bind(run.repository_id.get())
            .bind(next_index)
            .bind(&run.revision)
            .bind(Utc::now())
            .bind(Json(&run.job_configs))
            .bind(&run.job_config_context)
            .bind(Json(&run.labels))
            .bind(OrtRunStatus::Created.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;

        match row {
            Some(row) => run_from_row(&row),
            // Lost a race against a concurrent delivery of the same request.
            None => self
                .find_run_by_request(run.request_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("run for request {} vanished", run.request_id)),
        }
    }

    async fn get_run(&self, id: RunId) -> anyhow::Result<Option<OrtRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM ortflow_runs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, query: RunQuery) -> anyhow::Result<Vec<OrtRun>> {
        let statuses: Vec<String> = query
            .statuses
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM ortflow_runs
            WHERE ($1::BIGINT IS NULL OR repository_id = $1)
              AND (cardinality($2::TEXT[]) = 0 OR status = ANY($2))
            ORDER BY id
            LIMIT $3 OFFSET $4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(query.repository_id.map(|id| id.get()))
            .bind(&statuses)
            .bind(limit_param(query.limit))
            .bind(i64::try_from(query.offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn update_run(&self, id: RunId, update: RunUpdate) -> anyhow::Result<Option<OrtRun>> {
        let sql = format!(
            r#"
            UPDATE ortflow_runs
            SET resolved_job_configs = COALESCE($2, resolved_job_configs),
                labels = COALESCE($3, labels)
            WHERE id = $1
            RETURNING {RUN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(update.resolved_job_configs.as_ref().map(Json))
            .bind(update.labels.as_ref().map(Json))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn transition_run(
        &self,
        id: RunId,
        status: OrtRunStatus,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Transition<OrtRun>> {
        let predecessors: Vec<String> = status
            .allowed_predecessors()
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();
        let sql = format!(
            r#"
            UPDATE ortflow_runs
            SET status = $2,
                finished_at = CASE WHEN $3 THEN $4 ELSE finished_at END
            WHERE id = $1 AND status = ANY($5)
            RETURNING {RUN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(status.as_str())
            .bind(status.is_terminal())
            .bind(at)
            .bind(&predecessors)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            return Ok(Transition::Applied(run_from_row(&row)?));
        }

        match self.get_run(id).await? {
            Some(run) => {
                debug!(run_id = %id, from = %run.status, to = %status, "run transition rejected");
                Ok(Transition::Rejected(run))
            }
            None => Ok(Transition::NotFound),
        }
    }

    async fn create_job(
        &self,
        run_id: RunId,
        configuration: StageConfiguration,
    ) -> anyhow::Result<JobCreation> {
        let stage = configuration.stage();
        let sql = format!(
            r#"
            INSERT INTO ortflow_jobs (ort_run_id, stage, created_at, status, configuration)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (ort_run_id, stage) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        );
        let inserted = sqlx::query(&sql)
            .bind(run_id.get())
            .bind(stage.as_str())
            .bind(Utc::now())
            .bind(JobStatus::Created.as_str())
            .bind(Json(&configuration))
            .fetch_optional(&self.pool)
            .await;

        let row = match inserted {
            Ok(row) => row,
            Err(err) if is_foreign_key_violation(&err) => {
                anyhow::bail!("run {} not found", run_id)
            }
            Err(err) => return Err(err.into()),
        };

        if let Some(row) = row {
            return Ok(JobCreation::Created(job_from_row(&row)?));
        }

        let existing = self
            .get_job_for_run(run_id, stage)
            .await?
            .ok_or_else(|| anyhow::anyhow!("{} job of run {} vanished", stage, run_id))?;
        debug!(%run_id, %stage, job_id = %existing.id, "job already exists");
        Ok(JobCreation::Existing(existing))
    }

    async fn get_job(&self, id: JobId) -> anyhow::Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM ortflow_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_job_for_run(&self, run_id: RunId, stage: Stage) -> anyhow::Result<Option<Job>> {
        let sql =
            format!("SELECT {JOB_COLUMNS} FROM ortflow_jobs WHERE ort_run_id = $1 AND stage = $2");
        let row = sqlx::query(&sql)
            .bind(run_id.get())
            .bind(stage.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_jobs_for_run(&self, run_id: RunId) -> anyhow::Result<Vec<Job>> {
        let sql =
            format!("SELECT {JOB_COLUMNS} FROM ortflow_jobs WHERE ort_run_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(run_id.get())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_jobs(&self, query: JobQuery) -> anyhow::Result<Vec<Job>> {
        let statuses: Vec<String> = query
            .statuses
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM ortflow_jobs
            WHERE ($1::TEXT IS NULL OR stage = $1)
              AND (cardinality($2::TEXT[]) = 0 OR status = ANY($2))
              AND ($3::TIMESTAMPTZ IS NULL OR created_at < $3)
            ORDER BY id
            LIMIT $4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(query.stage.map(|stage| stage.as_str()))
            .bind(&statuses)
            .bind(query.created_before)
            .bind(limit_param(query.limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn transition_job(
        &self,
        id: JobId,
        status: JobStatus,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> anyhow::Result<Transition<Job>> {
        let predecessors: Vec<String> = status
            .allowed_predecessors()
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();
        let starts = matches!(status, JobStatus::Scheduled | JobStatus::Running);

        // Stamps the same fields as `Job::apply_transition`.
        let sql = format!(
            r#"
            UPDATE ortflow_jobs
            SET status = $2,
                started_at = CASE WHEN $3 THEN COALESCE(started_at, $5) ELSE started_at END,
                finished_at = CASE WHEN $4 THEN $5 ELSE finished_at END,
                error_message = CASE WHEN $4 THEN $6 ELSE error_message END
            WHERE id = $1 AND status = ANY($7)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(status.as_str())
            .bind(starts)
            .bind(status.is_terminal())
            .bind(at)
            .bind(&error)
            .bind(&predecessors)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            return Ok(Transition::Applied(job_from_row(&row)?));
        }

        match self.get_job(id).await? {
            Some(job) => {
                debug!(job_id = %id, from = %job.status, to = %status, "job transition rejected");
                Ok(Transition::Rejected(job))
            }
            None => Ok(Transition::NotFound),
        }
    }
}
