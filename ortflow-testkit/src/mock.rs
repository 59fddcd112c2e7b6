use async_trait::async_trait;
use ortflow::transport::StageEndpoint;
use ortflow::*;
use parking_lot::Mutex;
use std::sync::Arc;

/// A [`StageWorker`] for any stage that records every request it receives.
#[derive(Clone, Default)]
pub struct RecordingStageWorker {
    processed: Arc<Mutex<Vec<ProcessedRequest>>>,
    failure: Arc<Mutex<Option<String>>>,
}

#[derive(Clone, Debug)]
pub struct ProcessedRequest {
    pub stage: Stage,
    pub job_id: JobId,
    pub header: MessageHeader,
}

impl RecordingStageWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A worker that fails every job with `error`.
    pub fn failing(error: impl Into<String>) -> Self {
        let worker = Self::default();
        worker.set_failure(Some(error.into()));
        worker
    }

    pub fn set_failure(&self, error: Option<String>) {
        *self.failure.lock() = error;
    }

    pub fn processed(&self) -> Vec<ProcessedRequest> {
        self.processed.lock().clone()
    }

    pub fn processed_jobs(&self) -> Vec<JobId> {
        self.processed.lock().iter().map(|p| p.job_id).collect()
    }

    pub fn assert_processed_count_eq(&self, expected: usize) {
        let actual = self.processed.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {expected} processed jobs, got {actual}"
        );
    }
}

#[async_trait]
impl<E: StageEndpoint> StageWorker<E> for RecordingStageWorker {
    async fn process(&self, header: &MessageHeader, request: &E::Payload) -> anyhow::Result<()> {
        self.processed.lock().push(ProcessedRequest {
            stage: <E::Payload as JobRequest>::STAGE,
            job_id: request.job_id(),
            header: header.clone(),
        });

        let failure = self.failure.lock().clone();
        match failure {
            Some(error) => Err(anyhow::anyhow!(error)),
            None => Ok(()),
        }
    }
}
