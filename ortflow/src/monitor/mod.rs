//! Kubernetes job monitor.
//!
//! Workers running as Kubernetes Jobs may die without reporting back (OOM
//! kill, eviction, image pull failure, deletion). The monitor watches the
//! Jobs created by the Kubernetes transport and reports their native
//! outcome to the orchestrator. A worker that did report makes the monitor's
//! message a duplicate, which the orchestrator ignores.

pub mod observe;
pub mod reported;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, DeleteParams, ListParams};
use kube::runtime::{WatchStreamExt, watcher};
use kube::Client;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use crate::config::MonitorConfig;
use crate::message::Message;
use crate::runtime::ShutdownToken;
use crate::telemetry;
use crate::transport::kubernetes::WORKER_LABEL;
use crate::transport::{MessageSender, OrchestratorEndpoint};

pub use observe::{
    JobOutcome, ObservedJob, classify, finished_at, header_from_template, observe,
};
pub use reported::ReportedJobs;

/// Change to a watched Job.
#[derive(Clone, Debug)]
pub enum WorkloadEvent {
    Applied(Box<Job>),
    Deleted(Box<Job>),
}

/// Access to the Kubernetes Jobs created by the transport.
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// All Jobs carrying the worker label.
    async fn list(&self) -> anyhow::Result<Vec<Job>>;

    /// Delete a Job and its pods. Deleting a missing Job is not an error.
    async fn delete(&self, name: &str) -> anyhow::Result<()>;

    /// Endless stream of changes, reconnecting with backoff on errors.
    fn watch(&self) -> BoxStream<'static, anyhow::Result<WorkloadEvent>>;
}

/// [`WorkloadApi`] backed by the Kubernetes API of one namespace.
#[derive(Clone)]
pub struct KubeWorkloadApi {
    api: Api<Job>,
}

impl fmt::Debug for KubeWorkloadApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeWorkloadApi").finish_non_exhaustive()
    }
}

impl KubeWorkloadApi {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    pub async fn try_default(namespace: &str) -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }
}

#[async_trait]
impl WorkloadApi for KubeWorkloadApi {
    async fn list(&self) -> anyhow::Result<Vec<Job>> {
        let jobs = self
            .api
            .list(&ListParams::default().labels(WORKER_LABEL))
            .await?;
        Ok(jobs.items)
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        match self.api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn watch(&self) -> BoxStream<'static, anyhow::Result<WorkloadEvent>> {
        let config = watcher::Config::default().labels(WORKER_LABEL);
        watcher(self.api.clone(), config)
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Apply(job) | watcher::Event::InitApply(job)) => {
                        Some(Ok(WorkloadEvent::Applied(Box::new(job))))
                    }
                    Ok(watcher::Event::Delete(job)) => {
                        Some(Ok(WorkloadEvent::Deleted(Box::new(job))))
                    }
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
                    Err(err) => Some(Err(err.into())),
                }
            })
            .boxed()
    }
}

/// Counts from one [`JobMonitor::sweep`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepReport {
    pub listed: usize,
    pub reported: usize,
    pub pruned: usize,
}

pub struct JobMonitor {
    api: Arc<dyn WorkloadApi>,
    sender: MessageSender<OrchestratorEndpoint>,
    config: MonitorConfig,
    reported: Mutex<ReportedJobs>,
}

impl fmt::Debug for JobMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobMonitor")
            .field("config", &self.config)
            .field("reported", &self.reported.lock().len())
            .finish_non_exhaustive()
    }
}

impl JobMonitor {
    pub fn new(
        api: Arc<dyn WorkloadApi>,
        sender: MessageSender<OrchestratorEndpoint>,
        config: MonitorConfig,
    ) -> Self {
        let reported = ReportedJobs::new(config.reported_capacity, config.reported_retention);
        Self {
            api,
            sender,
            config,
            reported: Mutex::new(reported),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Watch Jobs and sweep periodically until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: ShutdownToken) -> anyhow::Result<()> {
        tracing::info!(namespace = %self.config.namespace, "job monitor started");

        let mut events = self.api.watch();
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("job monitor shutting down");
                    break;
                }
                _ = sweep.tick() => {
                    if let Err(err) = self.sweep(Utc::now()).await {
                        tracing::warn!("job monitor sweep failed: {err:#}");
                    }
                }
                event = events.next() => match event {
                    Some(Ok(event)) => self.handle_event(event, Utc::now()).await,
                    Some(Err(err)) => tracing::warn!("job watch error: {err:#}"),
                    None => {
                        tracing::warn!("job watch ended, restarting");
                        events = self.api.watch();
                    }
                },
            }
        }

        Ok(())
    }

    /// Handle one watch event. Failures are logged; the next sweep retries.
    pub async fn handle_event(&self, event: WorkloadEvent, now: DateTime<Utc>) {
        let (job, deleted) = match &event {
            WorkloadEvent::Applied(job) => (job, false),
            WorkloadEvent::Deleted(job) => (job, true),
        };

        if let Err(err) = self.handle_workload(job, deleted, now).await {
            tracing::error!(
                workload = job.metadata.name.as_deref().unwrap_or("<unnamed>"),
                "failed to handle job event: {err:#}"
            );
        }
    }

    /// Check every labelled Job for an unreported outcome or a timeout.
    pub async fn sweep(&self, now: DateTime<Utc>) -> anyhow::Result<SweepReport> {
        let jobs = self.api.list().await?;
        let mut report = SweepReport {
            listed: jobs.len(),
            ..Default::default()
        };

        for job in &jobs {
            match self.handle_workload(job, false, now).await {
                Ok(Some(_)) => report.reported += 1,
                Ok(None) => {}
                Err(err) => tracing::error!(
                    workload = job.metadata.name.as_deref().unwrap_or("<unnamed>"),
                    "failed to report job outcome: {err:#}"
                ),
            }
        }

        report.pruned = self.reported.lock().prune(now);
        tracing::debug!(
            listed = report.listed,
            reported = report.reported,
            pruned = report.pruned,
            "job monitor sweep completed"
        );
        Ok(report)
    }

    /// Report `job`'s outcome if it has one that was not reported yet.
    ///
    /// `deleted` marks a Job that disappeared from the cluster; without a
    /// terminal state it is reported as failed.
    pub async fn handle_workload(
        &self,
        job: &Job,
        deleted: bool,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<JobOutcome>> {
        let Some(observed) = observe(job) else {
            tracing::debug!(
                workload = job.metadata.name.as_deref().unwrap_or("<unnamed>"),
                "ignoring job without ortflow labels"
            );
            return Ok(None);
        };

        if self.reported.lock().contains(&observed.uid) {
            return Ok(None);
        }

        let outcome = match classify(job, now, self.config.job_timeout) {
            Some(outcome) => outcome,
            None if deleted => JobOutcome::Deleted,
            None => return Ok(None),
        };

        // Outcomes older than the dedup window were reported before their
        // entry was pruned. Jobs left in the cluster must not be re-sent on
        // every sweep.
        if self.is_stale(job, now) {
            tracing::debug!(
                workload = %observed.name,
                outcome = outcome.as_str(),
                "skipping job finished before the retention window"
            );
            return Ok(None);
        }

        self.report(&observed, &outcome)
            .instrument(telemetry::workload_span(&observed.name))
            .await?;
        self.reported.lock().insert(observed.uid.clone(), now);

        let delete = match outcome {
            JobOutcome::TimedOut { .. } => true,
            JobOutcome::Completed | JobOutcome::Failed { .. } => {
                self.config.delete_finished_jobs
            }
            JobOutcome::Deleted => false,
        };
        if delete && !deleted {
            if let Err(err) = self.api.delete(&observed.name).await {
                tracing::warn!(workload = %observed.name, "failed to delete job: {err:#}");
            }
        }

        Ok(Some(outcome))
    }

    fn is_stale(&self, job: &Job, now: DateTime<Utc>) -> bool {
        let Some(finished) = finished_at(job) else {
            return false;
        };
        chrono::Duration::from_std(self.config.reported_retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .is_some_and(|cutoff| finished < cutoff)
    }

    async fn report(&self, observed: &ObservedJob, outcome: &JobOutcome) -> anyhow::Result<()> {
        let payload = outcome.to_message(observed.stage, observed.job_id);
        self.sender
            .send(&Message::new(observed.header.clone(), payload))
            .await?;

        telemetry::record_monitor_report(observed.stage, observed.job_id, outcome.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::observe::tests::{with_condition, with_finished_condition, workload};
    use super::*;
    use crate::config::TransportConfig;
    use crate::job::JobId;
    use crate::message::{MessageHeader, OrchestratorMessage};
    use crate::stage::Stage;
    use crate::transport::{EndpointName, InMemoryBroker, TransportRegistry};

    #[derive(Default)]
    struct FakeWorkloads {
        jobs: Mutex<Vec<Job>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkloadApi for FakeWorkloads {
        async fn list(&self) -> anyhow::Result<Vec<Job>> {
            Ok(self.jobs.lock().clone())
        }

        async fn delete(&self, name: &str) -> anyhow::Result<()> {
            self.deleted.lock().push(name.to_string());
            Ok(())
        }

        fn watch(&self) -> BoxStream<'static, anyhow::Result<WorkloadEvent>> {
            futures::stream::pending().boxed()
        }
    }

    async fn monitor(
        api: Arc<FakeWorkloads>,
        config: MonitorConfig,
    ) -> (JobMonitor, InMemoryBroker) {
        let broker = InMemoryBroker::default();
        let registry = TransportRegistry::new().with_memory(broker.clone());
        let transport =
            TransportConfig::from_vars([("ORCHESTRATOR_SENDER_TRANSPORT_TYPE", "testing")]);
        let sender = registry.message_sender(&transport).await.unwrap();
        (JobMonitor::new(api, sender, config), broker)
    }

    fn reports(broker: &InMemoryBroker) -> Vec<Message<OrchestratorMessage>> {
        broker
            .take_messages(EndpointName::Orchestrator)
            .iter()
            .map(|wire| wire.decode::<OrchestratorEndpoint>().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_completed_job_reported_once() {
        let now = Utc::now();
        let api = Arc::new(FakeWorkloads::default());
        let job = with_condition(workload("analyzer-1-aa", "analyzer", 1, now), "Complete", None);
        api.jobs.lock().push(job.clone());
        let (monitor, broker) = monitor(api.clone(), MonitorConfig::default()).await;

        monitor
            .handle_event(WorkloadEvent::Applied(Box::new(job.clone())), now)
            .await;
        let sweep = monitor.sweep(now).await.unwrap();
        monitor
            .handle_event(WorkloadEvent::Deleted(Box::new(job)), now)
            .await;

        assert_eq!(sweep.reported, 0);
        let sent = reports(&broker);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header, MessageHeader::new("secret", "trace-analyzer-1-aa"));
        assert_eq!(
            sent[0].payload,
            OrchestratorMessage::worker_result(Stage::Analyzer, JobId(1))
        );
        assert!(api.deleted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_job_reports_reason_and_cleans_up() {
        let now = Utc::now();
        let api = Arc::new(FakeWorkloads::default());
        api.jobs.lock().push(with_condition(
            workload("scanner-3-bb", "scanner", 3, now),
            "Failed",
            Some("BackoffLimitExceeded"),
        ));
        let config = MonitorConfig {
            delete_finished_jobs: true,
            ..Default::default()
        };
        let (monitor, broker) = monitor(api.clone(), config).await;

        let sweep = monitor.sweep(now).await.unwrap();

        assert_eq!(sweep.reported, 1);
        assert_eq!(
            reports(&broker)[0].payload,
            OrchestratorMessage::worker_error(
                Stage::Scanner,
                JobId(3),
                Some("BackoffLimitExceeded".to_string())
            )
        );
        assert_eq!(*api.deleted.lock(), vec!["scanner-3-bb".to_string()]);
    }

    #[tokio::test]
    async fn test_stuck_job_timed_out_and_deleted() {
        let now = Utc::now();
        let api = Arc::new(FakeWorkloads::default());
        api.jobs.lock().push(workload(
            "advisor-2-cc",
            "advisor",
            2,
            now - chrono::Duration::hours(7),
        ));
        let (monitor, broker) = monitor(api.clone(), MonitorConfig::default()).await;

        monitor.sweep(now).await.unwrap();

        let sent = reports(&broker);
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0].payload,
            OrchestratorMessage::AdvisorWorkerError(error)
                if error.error.as_deref().is_some_and(|e| e.contains("timed out"))
        ));
        assert_eq!(*api.deleted.lock(), vec!["advisor-2-cc".to_string()]);
    }

    #[tokio::test]
    async fn test_deleted_running_job_reported_as_failure() {
        let now = Utc::now();
        let api = Arc::new(FakeWorkloads::default());
        let (monitor, broker) = monitor(api.clone(), MonitorConfig::default()).await;

        let job = workload("evaluator-5-dd", "evaluator", 5, now);
        monitor
            .handle_event(WorkloadEvent::Applied(Box::new(job.clone())), now)
            .await;
        assert!(reports(&broker).is_empty());

        monitor
            .handle_event(WorkloadEvent::Deleted(Box::new(job)), now)
            .await;
        assert_eq!(
            reports(&broker)[0].payload,
            OrchestratorMessage::worker_error(
                Stage::Evaluator,
                JobId(5),
                Some("job deleted before completion".to_string())
            )
        );
        assert!(api.deleted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_outcome_older_than_retention_not_resent() {
        let now = Utc::now();
        let api = Arc::new(FakeWorkloads::default());
        let finished = now - chrono::Duration::hours(30);
        api.jobs.lock().push(with_finished_condition(
            workload("reporter-6-ee", "reporter", 6, finished - chrono::Duration::minutes(5)),
            "Complete",
            finished,
        ));
        api.jobs.lock().push(with_finished_condition(
            workload("reporter-7-ff", "reporter", 7, now - chrono::Duration::minutes(5)),
            "Complete",
            now,
        ));
        let (monitor, broker) = monitor(api.clone(), MonitorConfig::default()).await;

        let first = monitor.sweep(now).await.unwrap();
        let later = now + chrono::Duration::hours(25);
        let second = monitor.sweep(later).await.unwrap();

        assert_eq!(first.reported, 1);
        assert_eq!(second.pruned, 1);
        assert_eq!(second.reported, 0);
        let sent = reports(&broker);
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].payload,
            OrchestratorMessage::worker_result(Stage::Reporter, JobId(7))
        );
    }

    #[tokio::test]
    async fn test_unlabelled_jobs_ignored() {
        let now = Utc::now();
        let api = Arc::new(FakeWorkloads::default());
        let mut job = with_condition(workload("backup", "analyzer", 1, now), "Complete", None);
        job.metadata.labels = None;
        api.jobs.lock().push(job);
        let (monitor, broker) = monitor(api, MonitorConfig::default()).await;

        let sweep = monitor.sweep(now).await.unwrap();

        assert_eq!(sweep.listed, 1);
        assert_eq!(sweep.reported, 0);
        assert!(reports(&broker).is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let api = Arc::new(FakeWorkloads::default());
        let config = MonitorConfig {
            sweep_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let (monitor, _broker) = monitor(api, config).await;
        let shutdown = ShutdownToken::new();

        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), monitor.run(shutdown))
            .await
            .expect("monitor did not stop")
            .unwrap();
    }
}
