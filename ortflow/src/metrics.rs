//! Prometheus metrics for ortflow.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `ortflow_jobs_scheduled_total` - Stage requests sent to workers
//! - `ortflow_job_transitions_total` - Job status changes applied by the orchestrator
//! - `ortflow_runs_completed_total` - Runs that reached a terminal status
//! - `ortflow_duplicate_deliveries_total` - Worker reports for jobs that were already terminal
//! - `ortflow_transport_send_failures_total` - Failed backend sends
//! - `ortflow_monitor_reports_total` - Outcomes reported by the Kubernetes job monitor
//!
//! ## Histograms
//! - `ortflow_job_duration_seconds` - Time from scheduling to a terminal job status
#![cfg(feature = "metrics")]

use prometheus::{CounterVec, HistogramVec, Opts, Registry, exponential_buckets};
use std::sync::LazyLock;

/// Global Prometheus registry for ortflow metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `stage`.
pub static JOBS_SCHEDULED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "ortflow_jobs_scheduled_total",
        "Total number of stage requests sent to workers",
    );
    CounterVec::new(opts, &["stage"]).expect("ortflow_jobs_scheduled_total metric creation failed")
});

/// Labels: `stage`, `status`.
pub static JOB_TRANSITIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "ortflow_job_transitions_total",
        "Total number of applied job status transitions",
    );
    CounterVec::new(opts, &["stage", "status"])
        .expect("ortflow_job_transitions_total metric creation failed")
});

/// Labels: `status` (FINISHED or FAILED).
pub static RUNS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "ortflow_runs_completed_total",
        "Total number of runs that reached a terminal status",
    );
    CounterVec::new(opts, &["status"]).expect("ortflow_runs_completed_total metric creation failed")
});

/// Labels: `stage`.
pub static DUPLICATE_DELIVERIES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "ortflow_duplicate_deliveries_total",
        "Total number of worker reports ignored because the job was already terminal",
    );
    CounterVec::new(opts, &["stage"])
        .expect("ortflow_duplicate_deliveries_total metric creation failed")
});

/// Labels: `endpoint`.
pub static TRANSPORT_SEND_FAILURES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "ortflow_transport_send_failures_total",
        "Total number of failed transport sends",
    );
    CounterVec::new(opts, &["endpoint"])
        .expect("ortflow_transport_send_failures_total metric creation failed")
});

/// Labels: `stage`, `outcome` (completed, failed, timed_out, deleted).
pub static MONITOR_REPORTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "ortflow_monitor_reports_total",
        "Total number of job outcomes reported by the Kubernetes job monitor",
    );
    CounterVec::new(opts, &["stage", "outcome"])
        .expect("ortflow_monitor_reports_total metric creation failed")
});

/// Labels: `stage`, `status`.
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    // 1s .. ~9h
    let buckets = exponential_buckets(1.0, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "ortflow_job_duration_seconds",
        "Job duration from scheduling to terminal status in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["stage", "status"])
        .expect("ortflow_job_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry.
///
/// Idempotent; calling it more than once is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_SCHEDULED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOB_TRANSITIONS_TOTAL.clone()),
        Box::new(RUNS_COMPLETED_TOTAL.clone()),
        Box::new(DUPLICATE_DELIVERIES_TOTAL.clone()),
        Box::new(TRANSPORT_SEND_FAILURES_TOTAL.clone()),
        Box::new(MONITOR_REPORTS_TOTAL.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_scheduled(stage: &str) {
    JOBS_SCHEDULED_TOTAL.with_label_values(&[stage]).inc();
}

pub fn record_job_transition(stage: &str, status: &str) {
    JOB_TRANSITIONS_TOTAL
        .with_label_values(&[stage, status])
        .inc();
}

pub fn record_run_completed(status: &str) {
    RUNS_COMPLETED_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_duplicate_delivery(stage: &str) {
    DUPLICATE_DELIVERIES_TOTAL.with_label_values(&[stage]).inc();
}

pub fn record_send_failure(endpoint: &str) {
    TRANSPORT_SEND_FAILURES_TOTAL
        .with_label_values(&[endpoint])
        .inc();
}

pub fn record_monitor_report(stage: &str, outcome: &str) {
    MONITOR_REPORTS_TOTAL
        .with_label_values(&[stage, outcome])
        .inc();
}

pub fn observe_job_duration(stage: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[stage, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
