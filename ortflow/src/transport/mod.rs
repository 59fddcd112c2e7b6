//! Backend-agnostic message transport.
//!
//! Every backend moves [`WireMessage`]s; typed [`Message`]s are converted at
//! the edges by [`MessageSender`] and [`start_receiver`]. Backends are created
//! through factories registered by name in a [`TransportRegistry`].

pub mod endpoint;
#[cfg(feature = "kubernetes")]
pub mod kubernetes;
pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;
pub mod redelivery;

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::{BackendConfig, TransportConfig, TransportRole};
use crate::error::TransportError;
use crate::message::{Message, MessageHeader};
use crate::runtime::ShutdownToken;
use crate::telemetry;

pub use endpoint::{
    AdvisorEndpoint, AnalyzerEndpoint, Endpoint, EndpointName, EvaluatorEndpoint,
    OrchestratorEndpoint, ReporterEndpoint, ScannerEndpoint, StageEndpoint,
};
pub use memory::{DeadLetter, InMemoryBroker};
pub use redelivery::{Redelivery, RedeliveryPolicy};

/// A message in its backend-neutral serialized form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub header: MessageHeader,
    pub payload: serde_json::Value,
}

impl WireMessage {
    pub fn encode<E: Endpoint>(message: &Message<E::Payload>) -> Result<Self, TransportError> {
        let payload =
            serde_json::to_value(&message.payload).map_err(|source| TransportError::Encode {
                endpoint: E::NAME.to_string(),
                source,
            })?;
        Ok(Self {
            header: message.header.clone(),
            payload,
        })
    }

    pub fn decode<E: Endpoint>(&self) -> Result<Message<E::Payload>, TransportError> {
        let payload = serde_json::from_value(self.payload.clone()).map_err(|source| {
            TransportError::Decode {
                endpoint: E::NAME.to_string(),
                source,
            }
        })?;
        Ok(Message::new(self.header.clone(), payload))
    }

    /// The payload's `kind` discriminant, if present.
    pub fn kind(&self) -> Option<&str> {
        self.payload.get("kind").and_then(serde_json::Value::as_str)
    }
}

/// Delivers messages to one endpoint.
#[async_trait]
pub trait SenderBackend: Send + Sync {
    /// At-least-once delivery; an error means the message may not have been
    /// delivered.
    async fn send(&self, message: &WireMessage) -> anyhow::Result<()>;
}

/// Invoked by a receiver loop for every delivered message.
///
/// Returning an error makes the message available for redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: WireMessage) -> anyhow::Result<()>;
}

/// Consumes messages from one endpoint.
#[async_trait]
pub trait ReceiverBackend: Send + Sync {
    /// Start the backend-owned delivery loop.
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<ReceiverHandle>;
}

/// Handle of a running delivery loop.
#[derive(Debug)]
pub struct ReceiverHandle {
    endpoint: EndpointName,
    shutdown: ShutdownToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl ReceiverHandle {
    pub fn new(
        endpoint: EndpointName,
        shutdown: ShutdownToken,
        task: JoinHandle<anyhow::Result<()>>,
    ) -> Self {
        Self {
            endpoint,
            shutdown,
            task,
        }
    }

    pub fn endpoint(&self) -> EndpointName {
        self.endpoint
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the loop and wait for in-flight handling to complete.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for the loop to end on its own.
    ///
    /// One-shot backends report the handler's failure here so the hosting
    /// process can exit unsuccessfully.
    pub async fn join(self) -> anyhow::Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(endpoint = %self.endpoint, "receiver task failed: {err:?}");
                Err(anyhow::anyhow!("receiver task for {} failed: {err}", self.endpoint))
            }
        }
    }
}

/// Creates sender backends of one kind.
#[async_trait]
pub trait SenderFactory: Send + Sync {
    /// Name the backend is selected by.
    fn name(&self) -> &'static str;

    async fn create_sender(&self, config: &BackendConfig) -> anyhow::Result<Arc<dyn SenderBackend>>;
}

/// Creates receiver backends of one kind.
#[async_trait]
pub trait ReceiverFactory: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_receiver(
        &self,
        config: &BackendConfig,
    ) -> anyhow::Result<Arc<dyn ReceiverBackend>>;
}

/// Name-keyed backend factories, populated explicitly at startup.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    senders: HashMap<&'static str, Arc<dyn SenderFactory>>,
    receivers: HashMap<&'static str, Arc<dyn ReceiverFactory>>,
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut senders: Vec<_> = self.senders.keys().collect();
        let mut receivers: Vec<_> = self.receivers.keys().collect();
        senders.sort();
        receivers.sort();

        f.debug_struct("TransportRegistry")
            .field("senders", &senders)
            .field("receivers", &receivers)
            .finish()
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every backend compiled into this build, except the
    /// in-memory one which needs a shared broker.
    pub fn builtin() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "kubernetes")]
        {
            registry.register_sender(Arc::new(kubernetes::KubernetesSenderFactory));
            registry.register_receiver(Arc::new(kubernetes::KubernetesReceiverFactory));
        }
        #[cfg(feature = "nats")]
        {
            registry.register_sender(Arc::new(nats::NatsSenderFactory));
            registry.register_receiver(Arc::new(nats::NatsReceiverFactory));
        }

        registry
    }

    /// Register the in-memory backend bound to `broker`.
    pub fn with_memory(mut self, broker: InMemoryBroker) -> Self {
        let factory = Arc::new(memory::InMemoryFactory::new(broker));
        self.register_sender(factory.clone());
        self.register_receiver(factory);
        self
    }

    pub fn register_sender(&mut self, factory: Arc<dyn SenderFactory>) {
        self.senders.insert(factory.name(), factory);
    }

    pub fn register_receiver(&mut self, factory: Arc<dyn ReceiverFactory>) {
        self.receivers.insert(factory.name(), factory);
    }

    pub async fn create_sender(
        &self,
        endpoint: EndpointName,
        config: &TransportConfig,
    ) -> Result<Arc<dyn SenderBackend>, TransportError> {
        let backend = config.backend(endpoint, TransportRole::Sender)?;
        let factory = self.senders.get(backend.backend.as_str()).ok_or_else(|| {
            TransportError::UnknownBackend {
                backend: backend.backend.clone(),
                role: TransportRole::Sender.as_str(),
            }
        })?;

        tracing::debug!(%endpoint, backend = %backend.backend, "creating sender");
        factory
            .create_sender(backend)
            .await
            .map_err(|source| TransportError::Send {
                endpoint: endpoint.to_string(),
                source,
            })
    }

    pub async fn create_receiver(
        &self,
        endpoint: EndpointName,
        config: &TransportConfig,
    ) -> Result<Arc<dyn ReceiverBackend>, TransportError> {
        let backend = config.backend(endpoint, TransportRole::Receiver)?;
        let factory = self.receivers.get(backend.backend.as_str()).ok_or_else(|| {
            TransportError::UnknownBackend {
                backend: backend.backend.clone(),
                role: TransportRole::Receiver.as_str(),
            }
        })?;

        tracing::debug!(%endpoint, backend = %backend.backend, "creating receiver");
        factory
            .create_receiver(backend)
            .await
            .map_err(|source| TransportError::Receive {
                endpoint: endpoint.to_string(),
                source,
            })
    }

    /// Typed sender for `E`, built from the configured backend.
    pub async fn message_sender<E: Endpoint>(
        &self,
        config: &TransportConfig,
    ) -> Result<MessageSender<E>, TransportError> {
        Ok(MessageSender::new(self.create_sender(E::NAME, config).await?))
    }
}

/// Typed sending side of an endpoint.
pub struct MessageSender<E: Endpoint> {
    backend: Arc<dyn SenderBackend>,
    _endpoint: PhantomData<fn() -> E>,
}

impl<E: Endpoint> Clone for MessageSender<E> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.backend))
    }
}

impl<E: Endpoint> fmt::Debug for MessageSender<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSender")
            .field("endpoint", &E::NAME)
            .field("payload_type", &type_name::<E::Payload>())
            .finish()
    }
}

impl<E: Endpoint> MessageSender<E> {
    pub fn new(backend: Arc<dyn SenderBackend>) -> Self {
        Self {
            backend,
            _endpoint: PhantomData,
        }
    }

    pub async fn send(&self, message: &Message<E::Payload>) -> Result<(), TransportError> {
        let wire = WireMessage::encode::<E>(message)?;
        self.send_wire(&wire).await
    }

    pub(crate) async fn send_wire(&self, wire: &WireMessage) -> Result<(), TransportError> {
        self.backend.send(wire).await.map_err(|source| {
            telemetry::record_send_failure(E::NAME, &source);
            TransportError::Send {
                endpoint: E::NAME.to_string(),
                source,
            }
        })
    }
}

/// Typed receiving side of an endpoint.
#[async_trait]
pub trait EndpointHandler<E: Endpoint>: Send + Sync {
    async fn handle(&self, message: Message<E::Payload>) -> anyhow::Result<()>;
}

struct TypedHandler<E, H> {
    inner: Arc<H>,
    _endpoint: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> MessageHandler for TypedHandler<E, H>
where
    E: Endpoint,
    H: EndpointHandler<E> + 'static,
{
    async fn handle(&self, message: WireMessage) -> anyhow::Result<()> {
        let typed = match message.decode::<E>() {
            Ok(typed) => typed,
            Err(err) => {
                // Redelivery cannot fix a payload this build does not understand.
                tracing::error!(
                    endpoint = %E::NAME,
                    trace_id = %message.header.trace_id,
                    kind = message.kind().unwrap_or("<none>"),
                    "dropping undecodable message: {err}"
                );
                return Ok(());
            }
        };
        self.inner.handle(typed).await
    }
}

/// Wrap a typed handler for use with any receiver backend.
pub fn typed_handler<E, H>(handler: Arc<H>) -> Arc<dyn MessageHandler>
where
    E: Endpoint,
    H: EndpointHandler<E> + 'static,
{
    Arc::new(TypedHandler::<E, H> {
        inner: handler,
        _endpoint: PhantomData,
    })
}

/// Start receiving `E` messages on `backend`, dispatching to `handler`.
pub async fn start_receiver<E, H>(
    backend: &dyn ReceiverBackend,
    handler: Arc<H>,
) -> anyhow::Result<ReceiverHandle>
where
    E: Endpoint,
    H: EndpointHandler<E> + 'static,
{
    tracing::info!(endpoint = %E::NAME, "starting receiver");
    backend.start(typed_handler::<E, H>(handler)).await
}
