use std::fmt;
use std::sync::Arc;

use crate::config::{OrchestratorConfig, TransportConfig};
use crate::error::TransportError;
use crate::orchestrator::{Orchestrator, StageSenders};
use crate::store::RunStore;
use crate::transport::{EndpointName, ReceiverBackend, TransportRegistry};

use super::supervisor::OrchestratorRuntime;

/// Builder for constructing an [`OrchestratorRuntime`] with explicit
/// dependencies.
///
/// The builder validates that all required dependencies are provided before
/// constructing the runtime. Transports can be set individually or created
/// from a [`TransportRegistry`] with [`with_transport`](Self::with_transport).
///
/// # Example
///
/// ```ignore
/// use ortflow::runtime::OrchestratorRuntimeBuilder;
///
/// let runtime = OrchestratorRuntimeBuilder::new(OrchestratorConfig::from_env()?)
///     .with_store(store)
///     .with_transport(&TransportRegistry::builtin(), &TransportConfig::from_env())
///     .await?
///     .build()?;
/// runtime.start().await?;
/// ```
pub struct OrchestratorRuntimeBuilder {
    config: OrchestratorConfig,
    store: Option<Arc<dyn RunStore>>,
    senders: Option<StageSenders>,
    receiver: Option<Arc<dyn ReceiverBackend>>,
}

impl fmt::Debug for OrchestratorRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorRuntimeBuilder")
            .field("config", &self.config)
            .field("store_set", &self.store.is_some())
            .field("senders_set", &self.senders.is_some())
            .field("receiver_set", &self.receiver.is_some())
            .finish()
    }
}

impl OrchestratorRuntimeBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            store: None,
            senders: None,
            receiver: None,
        }
    }

    /// Set the run/job store.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the senders for the stage endpoints.
    pub fn with_senders(mut self, senders: StageSenders) -> Self {
        self.senders = Some(senders);
        self
    }

    /// Set the receiver for the orchestrator endpoint.
    pub fn with_receiver(mut self, receiver: Arc<dyn ReceiverBackend>) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Create stage senders and the orchestrator receiver from the
    /// configured backends.
    pub async fn with_transport(
        self,
        registry: &TransportRegistry,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let senders = StageSenders::from_registry(registry, config).await?;
        let receiver = registry
            .create_receiver(EndpointName::Orchestrator, config)
            .await?;
        Ok(self.with_senders(senders).with_receiver(receiver))
    }

    /// Build the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if any required dependency is missing.
    pub fn build(self) -> anyhow::Result<OrchestratorRuntime> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let senders = self
            .senders
            .ok_or_else(|| anyhow::anyhow!("senders dependency missing"))?;
        let receiver = self
            .receiver
            .ok_or_else(|| anyhow::anyhow!("receiver dependency missing"))?;

        let orchestrator = Arc::new(Orchestrator::new(store, senders));
        Ok(OrchestratorRuntime::new(self.config, orchestrator, receiver))
    }
}
