//! Orchestrator behavior over the in-memory store and transport.
//!
//! Covers stage ordering, skipped stages, failure handling, duplicate and
//! contradictory reports, send failures and the recovery sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ortflow::transport::memory::DeliveryOutcome;
use ortflow::transport::{EndpointName, OrchestratorEndpoint};
use ortflow::{
    BackendConfig, InMemoryBroker, JobStatus, Message, OrchestratorError, OrchestratorMessage,
    OrtRunStatus, RepositoryId, ReporterJobConfiguration, RunStore, Stage, TransportRegistry,
    TransportRole, WireMessage,
};
use ortflow_testkit::{
    FAILING_BACKEND, FailingSenderFactory, TestHarness, all_stages, analyzer_only, create_ort_run,
    new_run, test_header, testing_transport,
};

#[tokio::test]
async fn test_full_pipeline_finishes_run() {
    let harness = TestHarness::new().await.unwrap();
    let create = create_ort_run(all_stages());
    let request_id = create.request_id;

    harness.submit(create).await.unwrap();
    let run = harness.run_for_request(request_id).await.unwrap();
    assert_eq!(run.status, OrtRunStatus::Active);
    assert_eq!(run.index, 1);
    assert_eq!(run.resolved_job_configs.as_ref(), Some(&run.job_configs));

    let analyzer = harness.complete_stage(Stage::Analyzer).await.unwrap();
    assert_eq!(analyzer.len(), 1);

    // Advisor and scanner only depend on the analyzer and run in parallel.
    assert_eq!(harness.complete_stage(Stage::Advisor).await.unwrap().len(), 1);
    assert_eq!(harness.complete_stage(Stage::Scanner).await.unwrap().len(), 1);
    assert_eq!(harness.complete_stage(Stage::Evaluator).await.unwrap().len(), 1);
    assert_eq!(harness.complete_stage(Stage::Reporter).await.unwrap().len(), 1);

    let run = harness.run(run.id).await.unwrap();
    assert_eq!(run.status, OrtRunStatus::Finished);
    assert!(run.finished_at.is_some());

    let jobs = harness.store.get_jobs_for_run(run.id).await.unwrap();
    assert_eq!(jobs.len(), 5);
    for job in jobs {
        assert_eq!(job.status, JobStatus::Finished, "{} job", job.stage());
        assert!(job.started_at.is_some());
        assert!(job.finished_at.is_some());
    }
}

#[tokio::test]
async fn test_first_jobs_are_scheduled_with_request_header() {
    let harness = TestHarness::new().await.unwrap();
    let create = create_ort_run(all_stages());
    let request_id = create.request_id;

    harness.submit(create).await.unwrap();

    let requests = harness.broker.take_messages(EndpointName::Analyzer);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].header, test_header());
    assert_eq!(harness.broker.pending_count(EndpointName::Advisor), 0);

    let run = harness.run_for_request(request_id).await.unwrap();
    let analyzer = harness.job(run.id, Stage::Analyzer).await.unwrap();
    assert_eq!(analyzer.status, JobStatus::Scheduled);
}

#[tokio::test]
async fn test_create_ort_run_is_idempotent() {
    let harness = TestHarness::new().await.unwrap();
    let create = create_ort_run(all_stages());

    harness.submit(create.clone()).await.unwrap();
    harness.submit(create.clone()).await.unwrap();

    assert_eq!(harness.store.run_count(), 1);
    harness.store.assert_job_count_eq(1);
    assert_eq!(harness.take_requests(Stage::Analyzer).unwrap().len(), 1);

    let run = harness.run_for_request(create.request_id).await.unwrap();
    assert_eq!(run.status, OrtRunStatus::Active);
}

#[tokio::test]
async fn test_runs_are_indexed_per_repository() {
    let harness = TestHarness::new().await.unwrap();
    let first = create_ort_run(analyzer_only());
    let second = create_ort_run(analyzer_only());
    let mut other = create_ort_run(analyzer_only());
    other.repository_id = RepositoryId(2);

    for create in [first.clone(), second.clone(), other.clone()] {
        harness.submit(create).await.unwrap();
    }

    let first = harness.run_for_request(first.request_id).await.unwrap();
    let second = harness.run_for_request(second.request_id).await.unwrap();
    let other = harness.run_for_request(other.request_id).await.unwrap();
    assert_eq!((first.index, second.index, other.index), (1, 2, 1));
}

#[tokio::test]
async fn test_evaluator_waits_for_advisor_and_scanner_in_either_order() {
    for (first, second) in [
        (Stage::Advisor, Stage::Scanner),
        (Stage::Scanner, Stage::Advisor),
    ] {
        let harness = TestHarness::new().await.unwrap();
        let create = create_ort_run(all_stages());
        let request_id = create.request_id;
        harness.submit(create).await.unwrap();
        harness.complete_stage(Stage::Analyzer).await.unwrap();

        let second_jobs = harness.take_requests(second).unwrap();
        assert_eq!(second_jobs.len(), 1);
        harness.complete_stage(first).await.unwrap();

        let run = harness.run_for_request(request_id).await.unwrap();
        assert!(harness.take_requests(Stage::Evaluator).unwrap().is_empty());
        assert!(
            harness
                .store
                .get_job_for_run(run.id, Stage::Evaluator)
                .await
                .unwrap()
                .is_none()
        );

        harness.report_result(second, second_jobs[0]).await.unwrap();
        assert_eq!(harness.take_requests(Stage::Evaluator).unwrap().len(), 1);
    }
}

#[tokio::test]
async fn test_disabled_stages_are_skipped() {
    let harness = TestHarness::new().await.unwrap();
    let mut configs = analyzer_only();
    configs.reporter = Some(ReporterJobConfiguration {
        formats: vec!["WebApp".to_string()],
        ..Default::default()
    });
    let create = create_ort_run(configs);
    let request_id = create.request_id;

    harness.submit(create).await.unwrap();
    harness.complete_stage(Stage::Analyzer).await.unwrap();

    // Advisor, scanner and evaluator are disabled, so the reporter follows.
    assert_eq!(harness.complete_stage(Stage::Reporter).await.unwrap().len(), 1);

    let run = harness.run_for_request(request_id).await.unwrap();
    assert_eq!(run.status, OrtRunStatus::Finished);
    harness.store.assert_job_count_eq(2);
    for stage in [Stage::Advisor, Stage::Scanner, Stage::Evaluator] {
        assert!(harness.take_requests(stage).unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_analyzer_only_run_finishes_after_analyzer() {
    let harness = TestHarness::new().await.unwrap();
    let create = create_ort_run(analyzer_only());
    let request_id = create.request_id;

    harness.submit(create).await.unwrap();
    harness.complete_stage(Stage::Analyzer).await.unwrap();

    let run = harness.run_for_request(request_id).await.unwrap();
    assert_eq!(run.status, OrtRunStatus::Finished);
}

#[tokio::test]
async fn test_analyzer_failure_fails_run() {
    let harness = TestHarness::new().await.unwrap();
    let create = create_ort_run(all_stages());
    let request_id = create.request_id;
    harness.submit(create).await.unwrap();

    let job_id = harness.take_requests(Stage::Analyzer).unwrap()[0];
    harness
        .report_error(Stage::Analyzer, job_id, "resolution failed")
        .await
        .unwrap();

    let run = harness.run_for_request(request_id).await.unwrap();
    assert_eq!(run.status, OrtRunStatus::Failed);

    let job = harness.job(run.id, Stage::Analyzer).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("resolution failed"));

    assert!(harness.take_requests(Stage::Advisor).unwrap().is_empty());
    assert!(harness.take_requests(Stage::Scanner).unwrap().is_empty());
    harness.store.assert_job_count_eq(1);
}

#[tokio::test]
async fn test_worker_error_without_message_gets_default_cause() {
    let harness = TestHarness::new().await.unwrap();
    let create = create_ort_run(analyzer_only());
    let request_id = create.request_id;
    harness.submit(create).await.unwrap();

    let job_id = harness.take_requests(Stage::Analyzer).unwrap()[0];
    harness
        .send(OrchestratorMessage::worker_error(Stage::Analyzer, job_id, None))
        .await
        .unwrap();

    let run = harness.run_for_request(request_id).await.unwrap();
    let job = harness.job(run.id, Stage::Analyzer).await.unwrap();
    assert_eq!(
        job.error_message.as_deref(),
        Some("analyzer worker reported an error")
    );
}

#[tokio::test]
async fn test_failure_waits_for_running_sibling() {
    let harness = TestHarness::new().await.unwrap();
    let create = create_ort_run(all_stages());
    let request_id = create.request_id;
    harness.submit(create).await.unwrap();
    harness.complete_stage(Stage::Analyzer).await.unwrap();

    let advisor = harness.take_requests(Stage::Advisor).unwrap()[0];
    let scanner = harness.take_requests(Stage::Scanner).unwrap()[0];

    harness
        .report_error(Stage::Advisor, advisor, "advisor unavailable")
        .await
        .unwrap();
    let run = harness.run_for_request(request_id).await.unwrap();
    assert_eq!(run.status, OrtRunStatus::Active);

    harness.report_result(Stage::Scanner, scanner).await.unwrap();
    let run = harness.run(run.id).await.unwrap();
    assert_eq!(run.status, OrtRunStatus::Failed);

    assert!(harness.take_requests(Stage::Evaluator).unwrap().is_empty());
    assert!(
        harness
            .store
            .get_job_for_run(run.id, Stage::Evaluator)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_duplicate_result_is_ignored() {
    let harness = TestHarness::new().await.unwrap();
    let create = create_ort_run(all_stages());
    let request_id = create.request_id;
    harness.submit(create).await.unwrap();

    let job_id = harness.take_requests(Stage::Analyzer).unwrap()[0];
    harness.report_result(Stage::Analyzer, job_id).await.unwrap();
    harness.report_result(Stage::Analyzer, job_id).await.unwrap();

    assert_eq!(harness.take_requests(Stage::Advisor).unwrap().len(), 1);
    assert_eq!(harness.take_requests(Stage::Scanner).unwrap().len(), 1);
    harness.store.assert_job_count_eq(3);

    let run = harness.run_for_request(request_id).await.unwrap();
    let job = harness.job(run.id, Stage::Analyzer).await.unwrap();
    assert_eq!(job.status, JobStatus::Finished);
}

#[tokio::test]
async fn test_late_error_does_not_overwrite_result() {
    let harness = TestHarness::new().await.unwrap();
    let create = create_ort_run(analyzer_only());
    let request_id = create.request_id;
    harness.submit(create).await.unwrap();

    let job_id = harness.take_requests(Stage::Analyzer).unwrap()[0];
    harness.report_result(Stage::Analyzer, job_id).await.unwrap();
    harness
        .report_error(Stage::Analyzer, job_id, "too late")
        .await
        .unwrap();

    let run = harness.run_for_request(request_id).await.unwrap();
    assert_eq!(run.status, OrtRunStatus::Finished);
    let job = harness.job(run.id, Stage::Analyzer).await.unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.error_message, None);
}

#[tokio::test]
async fn test_report_for_unknown_job_is_rejected() {
    let harness = TestHarness::new().await.unwrap();

    let err = harness
        .report_result(Stage::Scanner, ortflow::JobId(404))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownJob { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_report_for_wrong_stage_is_rejected() {
    let harness = TestHarness::new().await.unwrap();
    harness.submit(create_ort_run(all_stages())).await.unwrap();
    let job_id = harness.take_requests(Stage::Analyzer).unwrap()[0];

    let err = harness
        .report_result(Stage::Scanner, job_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::StageMismatch {
            expected: Stage::Scanner,
            actual: Stage::Analyzer,
            ..
        }
    ));
    assert!(harness.take_requests(Stage::Advisor).unwrap().is_empty());
}

#[tokio::test]
async fn test_inconsistent_messages_are_dropped_by_receiver() {
    let harness = TestHarness::new().await.unwrap();
    let message = Message::new(
        test_header(),
        OrchestratorMessage::worker_result(Stage::Reporter, ortflow::JobId(77)),
    );
    harness.broker.publish(
        EndpointName::Orchestrator,
        WireMessage::encode::<OrchestratorEndpoint>(&message).unwrap(),
    );

    let outcomes = harness.deliver_reports().await;
    assert_eq!(outcomes, vec![DeliveryOutcome::Acked]);
    assert!(harness.broker.dead_letters(EndpointName::Orchestrator).is_empty());
}

#[tokio::test]
async fn test_reports_delivered_through_broker() {
    let harness = TestHarness::new().await.unwrap();
    let create = create_ort_run(analyzer_only());
    let request_id = create.request_id;
    let message = Message::new(test_header(), OrchestratorMessage::CreateOrtRun(create));
    harness.broker.publish(
        EndpointName::Orchestrator,
        WireMessage::encode::<OrchestratorEndpoint>(&message).unwrap(),
    );

    assert_eq!(harness.deliver_reports().await, vec![DeliveryOutcome::Acked]);
    let run = harness.run_for_request(request_id).await.unwrap();
    assert_eq!(run.status, OrtRunStatus::Active);
}

#[tokio::test]
async fn test_recovery_resends_stale_created_job() {
    let harness = TestHarness::new().await.unwrap();
    let store = &harness.store;

    let run = store.create_run(new_run(RepositoryId(1))).await.unwrap();
    let config = run.job_configs.configuration_for(Stage::Analyzer).unwrap();
    let job = store.create_job(run.id, config).await.unwrap().into_job();
    store.backdate_job(job.id, Utc::now() - chrono::Duration::minutes(10));

    let report = harness
        .orchestrator
        .recover_pending(Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(report.resent_jobs, 1);
    assert_eq!(report.failures, 0);

    assert_eq!(harness.take_requests(Stage::Analyzer).unwrap(), vec![job.id]);
    let job = harness.job(run.id, Stage::Analyzer).await.unwrap();
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(harness.run(run.id).await.unwrap().status, OrtRunStatus::Active);

    let again = harness
        .orchestrator
        .recover_pending(Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(again.resent_jobs, 0);
}

#[tokio::test]
async fn test_recovery_ignores_fresh_jobs() {
    let harness = TestHarness::new().await.unwrap();
    let store = &harness.store;

    let run = store.create_run(new_run(RepositoryId(1))).await.unwrap();
    let config = run.job_configs.configuration_for(Stage::Analyzer).unwrap();
    store.create_job(run.id, config).await.unwrap();

    let report = harness
        .orchestrator
        .recover_pending(Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(report.resent_jobs, 0);
    assert_eq!(report.advanced_runs, 0);
    assert!(harness.take_requests(Stage::Analyzer).unwrap().is_empty());
}

#[tokio::test]
async fn test_recovery_advances_stalled_runs() {
    let harness = TestHarness::new().await.unwrap();
    let store = &harness.store;

    // Created but never advanced.
    let idle = store.create_run(new_run(RepositoryId(1))).await.unwrap();
    store.backdate_run(idle.id, Utc::now() - chrono::Duration::minutes(10));

    // Every job terminal but the run still open.
    let done = store.create_run(new_run(RepositoryId(2))).await.unwrap();
    let config = done.job_configs.configuration_for(Stage::Analyzer).unwrap();
    let job = store.create_job(done.id, config).await.unwrap().into_job();
    store
        .transition_job(job.id, JobStatus::Finished, Utc::now(), None)
        .await
        .unwrap();

    let report = harness
        .orchestrator
        .recover_pending(Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(report.advanced_runs, 2);

    assert_eq!(harness.take_requests(Stage::Analyzer).unwrap().len(), 1);
    assert_eq!(harness.run(idle.id).await.unwrap().status, OrtRunStatus::Active);
    assert_eq!(harness.run(done.id).await.unwrap().status, OrtRunStatus::Finished);
}

fn without_reporter() -> ortflow::JobConfigurations {
    let mut configs = all_stages();
    configs.reporter = None;
    configs
}

#[tokio::test]
async fn test_run_without_reporter_finishes_after_evaluator() {
    let harness = TestHarness::new().await.unwrap();
    let create = create_ort_run(without_reporter());
    let request_id = create.request_id;
    harness.submit(create).await.unwrap();

    harness.complete_stage(Stage::Analyzer).await.unwrap();
    harness.complete_stage(Stage::Advisor).await.unwrap();
    harness.complete_stage(Stage::Scanner).await.unwrap();
    harness.complete_stage(Stage::Evaluator).await.unwrap();

    let run = harness.run_for_request(request_id).await.unwrap();
    assert_eq!(run.status, OrtRunStatus::Finished);

    let jobs = harness.store.get_jobs_for_run(run.id).await.unwrap();
    assert_eq!(jobs.len(), 4);
    assert!(jobs.iter().all(|job| job.status == JobStatus::Finished));
    assert!(jobs.iter().all(|job| job.stage() != Stage::Reporter));
}

#[tokio::test]
async fn test_scanner_error_fails_run_after_advisor_finished() {
    let harness = TestHarness::new().await.unwrap();
    let create = create_ort_run(without_reporter());
    let request_id = create.request_id;
    harness.submit(create).await.unwrap();
    harness.complete_stage(Stage::Analyzer).await.unwrap();

    let scanner = harness.take_requests(Stage::Scanner).unwrap()[0];
    harness
        .report_error(Stage::Scanner, scanner, "scan timed out")
        .await
        .unwrap();
    let run = harness.run_for_request(request_id).await.unwrap();
    assert_eq!(run.status, OrtRunStatus::Active);

    harness.complete_stage(Stage::Advisor).await.unwrap();
    let run = harness.run(run.id).await.unwrap();
    assert_eq!(run.status, OrtRunStatus::Failed);
    assert!(
        harness
            .store
            .get_job_for_run(run.id, Stage::Evaluator)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_evaluator_follows_scanner_when_advisor_disabled() {
    let harness = TestHarness::new().await.unwrap();
    let mut configs = without_reporter();
    configs.advisor = None;
    let create = create_ort_run(configs);
    let request_id = create.request_id;
    harness.submit(create).await.unwrap();
    harness.complete_stage(Stage::Analyzer).await.unwrap();

    assert!(harness.take_requests(Stage::Advisor).unwrap().is_empty());
    harness.complete_stage(Stage::Scanner).await.unwrap();
    assert_eq!(harness.take_requests(Stage::Evaluator).unwrap().len(), 1);

    let run = harness.run_for_request(request_id).await.unwrap();
    assert!(
        harness
            .store
            .get_job_for_run(run.id, Stage::Advisor)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_at_most_one_active_job_per_stage() {
    let harness = TestHarness::new().await.unwrap();
    let create = create_ort_run(all_stages());
    let request_id = create.request_id;
    harness.submit(create.clone()).await.unwrap();

    let analyzer = harness.take_requests(Stage::Analyzer).unwrap()[0];
    // Redelivered reports and requests interleaved with progress.
    for _ in 0..3 {
        harness.report_result(Stage::Analyzer, analyzer).await.unwrap();
        harness.submit(create.clone()).await.unwrap();
    }

    let run = harness.run_for_request(request_id).await.unwrap();
    let jobs = harness.store.get_jobs_for_run(run.id).await.unwrap();
    for stage in Stage::ALL {
        let active = jobs
            .iter()
            .filter(|job| job.stage() == stage && !job.is_terminal())
            .count();
        assert!(active <= 1, "{stage} has {active} active jobs");
    }
    assert_eq!(jobs.len(), 3);
}

async fn harness_failing_on(stage: Stage) -> (TestHarness, FailingSenderFactory) {
    let broker = InMemoryBroker::default();
    let failing = FailingSenderFactory::new(broker.clone());
    let mut registry = TransportRegistry::new().with_memory(broker.clone());
    registry.register_sender(Arc::new(failing.clone()));
    let transport = testing_transport().with_backend(BackendConfig::new(
        stage.into(),
        TransportRole::Sender,
        FAILING_BACKEND,
    ));

    let harness = TestHarness::with_transport(broker, registry, transport)
        .await
        .unwrap();
    (harness, failing)
}

#[tokio::test]
async fn test_send_failure_leaves_job_created_until_recovery() {
    let (harness, failing) = harness_failing_on(Stage::Analyzer).await;
    #[cfg(feature = "metrics")]
    let failures_before = ortflow::metrics::TRANSPORT_SEND_FAILURES_TOTAL
        .with_label_values(&["analyzer"])
        .get();

    let create = create_ort_run(analyzer_only());
    let request_id = create.request_id;
    let err = harness.submit(create.clone()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Transport(_)));
    assert!(err.is_retryable());
    assert_eq!(failing.rejected(), 1);
    #[cfg(feature = "metrics")]
    assert!(
        ortflow::metrics::TRANSPORT_SEND_FAILURES_TOTAL
            .with_label_values(&["analyzer"])
            .get()
            >= failures_before + 1.0
    );

    let run = harness.run_for_request(request_id).await.unwrap();
    assert_eq!(run.status, OrtRunStatus::Created);
    let job = harness.job(run.id, Stage::Analyzer).await.unwrap();
    assert_eq!(job.status, JobStatus::Created);
    assert!(harness.take_requests(Stage::Analyzer).unwrap().is_empty());

    // Redelivery finds the existing job and leaves it to the recovery sweep.
    harness.submit(create).await.unwrap();
    harness.store.assert_job_count_eq(1);
    assert_eq!(failing.rejected(), 1);
    assert_eq!(
        harness.job(run.id, Stage::Analyzer).await.unwrap().status,
        JobStatus::Created
    );

    failing.set_failing(false);
    harness
        .store
        .backdate_job(job.id, Utc::now() - chrono::Duration::minutes(10));
    let report = harness
        .orchestrator
        .recover_pending(Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(report.resent_jobs, 1);
    assert_eq!(report.failures, 0);
    assert_eq!(harness.take_requests(Stage::Analyzer).unwrap(), vec![job.id]);
    assert_eq!(
        harness.job(run.id, Stage::Analyzer).await.unwrap().status,
        JobStatus::Scheduled
    );
    assert_eq!(harness.run(run.id).await.unwrap().status, OrtRunStatus::Active);
}

#[tokio::test]
async fn test_send_failure_after_worker_result_is_redelivered_without_new_job() {
    let (harness, failing) = harness_failing_on(Stage::Advisor).await;
    let create = create_ort_run(all_stages());
    let request_id = create.request_id;
    harness.submit(create).await.unwrap();
    let run = harness.run_for_request(request_id).await.unwrap();

    let analyzer = harness.take_requests(Stage::Analyzer).unwrap();
    let err = harness
        .report_result(Stage::Analyzer, analyzer[0])
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(
        harness.job(run.id, Stage::Analyzer).await.unwrap().status,
        JobStatus::Finished
    );
    let advisor = harness.job(run.id, Stage::Advisor).await.unwrap();
    assert_eq!(advisor.status, JobStatus::Created);

    harness.report_result(Stage::Analyzer, analyzer[0]).await.unwrap();
    let advisor_jobs = harness
        .store
        .get_jobs_for_run(run.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|job| job.stage() == Stage::Advisor)
        .count();
    assert_eq!(advisor_jobs, 1);
    assert_eq!(failing.rejected(), 1);

    failing.set_failing(false);
    harness
        .store
        .backdate_job(advisor.id, Utc::now() - chrono::Duration::minutes(10));
    harness
        .orchestrator
        .recover_pending(Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(harness.take_requests(Stage::Advisor).unwrap(), vec![advisor.id]);
    assert_eq!(
        harness.job(run.id, Stage::Advisor).await.unwrap().status,
        JobStatus::Scheduled
    );
}
