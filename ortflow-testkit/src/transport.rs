use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use ortflow::transport::{EndpointName, SenderBackend, SenderFactory, WireMessage};
use ortflow::{BackendConfig, InMemoryBroker};

/// Backend name of [`FailingSenderFactory`].
pub const FAILING_BACKEND: &str = "failing";

/// Sender backend that rejects every message while switched on and
/// otherwise publishes to an [`InMemoryBroker`].
///
/// Clones share the switch, so a test can keep one to heal the transport
/// after registering another.
#[derive(Clone)]
pub struct FailingSenderFactory {
    broker: InMemoryBroker,
    failing: Arc<AtomicBool>,
    rejected: Arc<AtomicUsize>,
}

impl FailingSenderFactory {
    /// A factory whose senders start out failing.
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            failing: Arc::new(AtomicBool::new(true)),
            rejected: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of messages rejected so far.
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SenderFactory for FailingSenderFactory {
    fn name(&self) -> &'static str {
        FAILING_BACKEND
    }

    async fn create_sender(&self, config: &BackendConfig) -> anyhow::Result<Arc<dyn SenderBackend>> {
        Ok(Arc::new(FailingSender {
            factory: self.clone(),
            endpoint: config.endpoint,
        }))
    }
}

struct FailingSender {
    factory: FailingSenderFactory,
    endpoint: EndpointName,
}

#[async_trait]
impl SenderBackend for FailingSender {
    async fn send(&self, message: &WireMessage) -> anyhow::Result<()> {
        if self.factory.failing.load(Ordering::SeqCst) {
            self.factory.rejected.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("{} broker unavailable", self.endpoint);
        }
        self.factory.broker.publish(self.endpoint, message.clone());
        Ok(())
    }
}
