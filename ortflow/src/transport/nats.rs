//! NATS JetStream transport backend.
//!
//! Each endpoint gets its own stream with a single subject. Receivers use a
//! durable pull consumer with explicit acknowledgement; a failed handler
//! NAKs the message with the policy's backoff delay, and the last permitted
//! attempt terminates it instead.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_nats::jetstream::{self, AckKind, consumer, stream};
use async_trait::async_trait;
use futures::StreamExt;

use super::{
    EndpointName, MessageHandler, ReceiverBackend, ReceiverFactory, ReceiverHandle, Redelivery,
    RedeliveryPolicy, SenderBackend, SenderFactory, WireMessage,
};
use crate::config::BackendConfig;
use crate::error::{ConfigError, JobFailed};
use crate::runtime::ShutdownToken;

pub const BACKEND_NAME: &str = "nats";

const DEFAULT_URL: &str = "nats://localhost:4222";
const DEFAULT_STREAM_PREFIX: &str = "ortflow";

/// Pause after a failed pull before asking the server again.
const PULL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq)]
pub struct NatsConfig {
    pub url: String,
    pub stream_prefix: String,
    pub redelivery: RedeliveryPolicy,
}

impl NatsConfig {
    pub fn from_backend_config(config: &BackendConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            url: config.option("url").unwrap_or(DEFAULT_URL).to_string(),
            stream_prefix: config
                .option("streamPrefix")
                .unwrap_or(DEFAULT_STREAM_PREFIX)
                .to_string(),
            redelivery: RedeliveryPolicy::from_backend_config(config)?,
        })
    }

    pub fn stream_name(&self, endpoint: EndpointName) -> String {
        format!("{}-{endpoint}", self.stream_prefix)
    }

    pub fn subject(&self, endpoint: EndpointName) -> String {
        format!("{}.{endpoint}", self.stream_prefix)
    }

    pub fn consumer_name(&self, endpoint: EndpointName) -> String {
        format!("{}-{endpoint}-receiver", self.stream_prefix)
    }
}

async fn connect(
    config: &NatsConfig,
    endpoint: EndpointName,
) -> anyhow::Result<(jetstream::Context, stream::Stream)> {
    let client = async_nats::connect(&config.url)
        .await
        .with_context(|| format!("failed to connect to NATS at {}", config.url))?;
    let context = jetstream::new(client);

    let stream = context
        .get_or_create_stream(stream::Config {
            name: config.stream_name(endpoint),
            subjects: vec![config.subject(endpoint)],
            storage: stream::StorageType::File,
            ..Default::default()
        })
        .await
        .map_err(|err| {
            anyhow::anyhow!("failed to create stream {}: {err}", config.stream_name(endpoint))
        })?;

    Ok((context, stream))
}

pub struct NatsSender {
    context: jetstream::Context,
    subject: String,
}

#[async_trait]
impl SenderBackend for NatsSender {
    async fn send(&self, message: &WireMessage) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(message).context("serializing message")?;
        let ack = self
            .context
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|err| anyhow::anyhow!("publish to {} failed: {err}", self.subject))?;
        // The message is only durable once the server acknowledged it.
        ack.await
            .map_err(|err| anyhow::anyhow!("publish to {} not acknowledged: {err}", self.subject))?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct NatsReceiver {
    endpoint: EndpointName,
    stream: stream::Stream,
    config: NatsConfig,
}

impl NatsReceiver {
    async fn consume(
        self,
        handler: Arc<dyn MessageHandler>,
        shutdown: ShutdownToken,
    ) -> anyhow::Result<()> {
        let endpoint = self.endpoint;
        let name = self.config.consumer_name(endpoint);
        let consumer = self
            .stream
            .get_or_create_consumer(
                &name,
                consumer::pull::Config {
                    durable_name: Some(name.clone()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    max_deliver: i64::from(self.config.redelivery.max_attempts),
                    filter_subject: self.config.subject(endpoint),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| anyhow::anyhow!("failed to create consumer {name}: {err}"))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|err| anyhow::anyhow!("failed to open message stream: {err}"))?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = messages.next() => match next {
                    None => {
                        tracing::warn!(%endpoint, "NATS message stream ended");
                        break;
                    }
                    Some(Err(err)) => {
                        tracing::warn!(%endpoint, "NATS pull failed: {err}");
                        tokio::time::sleep(PULL_ERROR_BACKOFF).await;
                    }
                    Some(Ok(message)) => self.process(message, handler.as_ref()).await,
                }
            }
        }

        Ok(())
    }

    async fn process(&self, message: jetstream::Message, handler: &dyn MessageHandler) {
        let endpoint = self.endpoint;
        let delivered = message
            .info()
            .map(|info| info.delivered)
            .unwrap_or(1)
            .max(1);

        let result = match serde_json::from_slice::<WireMessage>(&message.payload) {
            Ok(wire) => handler.handle(wire).await,
            Err(err) => {
                tracing::error!(%endpoint, "dropping malformed message: {err}");
                Ok(())
            }
        };

        let ack = match result {
            Ok(()) => AckKind::Ack,
            Err(err) if JobFailed::is_reported(&err) => {
                tracing::debug!(%endpoint, "{err:#}");
                AckKind::Ack
            }
            Err(err) => match self.config.redelivery.decide(delivered as u32) {
                Redelivery::Retry { delay } => {
                    tracing::warn!(
                        %endpoint,
                        delivered,
                        "handler failed, message will be redelivered: {err:#}"
                    );
                    AckKind::Nak(Some(delay))
                }
                Redelivery::DeadLetter => {
                    tracing::error!(
                        %endpoint,
                        delivered,
                        "handler failed, giving up on message: {err:#}"
                    );
                    AckKind::Term
                }
            },
        };

        if let Err(err) = message.ack_with(ack).await {
            tracing::error!(%endpoint, "failed to acknowledge message: {err}");
        }
    }
}

#[async_trait]
impl ReceiverBackend for NatsReceiver {
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<ReceiverHandle> {
        let shutdown = ShutdownToken::new();
        let task = tokio::spawn(self.clone().consume(handler, shutdown.clone()));
        Ok(ReceiverHandle::new(self.endpoint, shutdown, task))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NatsSenderFactory;

#[async_trait]
impl SenderFactory for NatsSenderFactory {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn create_sender(
        &self,
        config: &BackendConfig,
    ) -> anyhow::Result<Arc<dyn SenderBackend>> {
        let nats = NatsConfig::from_backend_config(config)?;
        let (context, _stream) = connect(&nats, config.endpoint).await?;
        Ok(Arc::new(NatsSender {
            context,
            subject: nats.subject(config.endpoint),
        }))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NatsReceiverFactory;

#[async_trait]
impl ReceiverFactory for NatsReceiverFactory {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn create_receiver(
        &self,
        config: &BackendConfig,
    ) -> anyhow::Result<Arc<dyn ReceiverBackend>> {
        let nats = NatsConfig::from_backend_config(config)?;
        let (_context, stream) = connect(&nats, config.endpoint).await?;
        Ok(Arc::new(NatsReceiver {
            endpoint: config.endpoint,
            stream,
            config: nats,
        }))
    }
}
