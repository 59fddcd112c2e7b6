use ortflow::*;
use std::collections::BTreeMap;
use uuid::Uuid;

pub fn test_header() -> MessageHeader {
    MessageHeader::new("test-token", "test-trace")
}

/// Configuration with only the mandatory analyzer stage.
pub fn analyzer_only() -> JobConfigurations {
    JobConfigurations::default()
}

/// Configuration enabling all five stages with default settings.
pub fn all_stages() -> JobConfigurations {
    JobConfigurations {
        advisor: Some(AdvisorJobConfiguration::default()),
        scanner: Some(ScannerJobConfiguration::default()),
        evaluator: Some(EvaluatorJobConfiguration::default()),
        reporter: Some(ReporterJobConfiguration::default()),
        ..Default::default()
    }
}

/// A run request for repository 1 with a fresh request id.
pub fn create_ort_run(job_configs: JobConfigurations) -> CreateOrtRun {
    CreateOrtRun {
        request_id: Uuid::now_v7(),
        repository_id: RepositoryId(1),
        revision: "main".to_string(),
        job_configs,
        job_config_context: None,
        labels: BTreeMap::from([("origin".to_string(), "testkit".to_string())]),
    }
}

/// Store input for an analyzer-only run of `repository_id`.
pub fn new_run(repository_id: RepositoryId) -> NewOrtRun {
    NewOrtRun {
        request_id: Uuid::now_v7(),
        repository_id,
        revision: "main".to_string(),
        job_configs: analyzer_only(),
        job_config_context: None,
        labels: BTreeMap::new(),
    }
}

/// Transport configuration routing every endpoint through the `testing`
/// backend.
pub fn testing_transport() -> TransportConfig {
    let mut config = TransportConfig::default();
    for endpoint in transport::EndpointName::ALL {
        for role in [TransportRole::Sender, TransportRole::Receiver] {
            config = config.with_backend(BackendConfig::new(endpoint, role, "testing"));
        }
    }
    config
}
