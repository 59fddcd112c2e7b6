//! Transport backend that runs one Kubernetes Job per message.
//!
//! Sending creates a `batch/v1` Job whose container receives the message in
//! its environment. Receiving, on the worker side, reads that environment
//! once and invokes the handler a single time.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use uuid::Uuid;

use super::{
    EndpointName, MessageHandler, ReceiverBackend, ReceiverFactory, ReceiverHandle,
    SenderBackend, SenderFactory, WireMessage,
};
use crate::config::BackendConfig;
use crate::error::{ConfigError, JobFailed};
use crate::message::MessageHeader;
use crate::runtime::ShutdownToken;

pub const BACKEND_NAME: &str = "kubernetes";

/// Label carrying the endpoint the Job was created for.
pub const WORKER_LABEL: &str = "ort-worker";
pub const JOB_ID_LABEL: &str = "ort-job-id";
pub const TRACE_ID_LABEL: &str = "ort-trace-id";

pub const TOKEN_VAR: &str = "token";
pub const TRACE_ID_VAR: &str = "traceId";
pub const PAYLOAD_VAR: &str = "payload";

/// Options of the Kubernetes sender.
#[derive(Clone, Debug, PartialEq)]
pub struct KubernetesSenderConfig {
    pub namespace: String,
    pub image_name: String,
    pub image_pull_policy: Option<String>,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub service_account: Option<String>,
    pub backoff_limit: Option<i32>,
    pub ttl_seconds_after_finished: Option<i32>,
    pub active_deadline_seconds: Option<i64>,
}

impl KubernetesSenderConfig {
    pub fn from_backend_config(config: &BackendConfig) -> Result<Self, ConfigError> {
        let words = |name: &str| {
            config
                .option(name)
                .map(|value| value.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default()
        };

        Ok(Self {
            namespace: config.option("namespace").unwrap_or("default").to_string(),
            image_name: config.require_option("imageName")?.to_string(),
            image_pull_policy: config.option("imagePullPolicy").map(str::to_string),
            command: words("command"),
            args: words("args"),
            service_account: config.option("serviceAccount").map(str::to_string),
            backoff_limit: config.parse_option("backoffLimit")?,
            ttl_seconds_after_finished: config.parse_option("ttlSecondsAfterFinished")?,
            active_deadline_seconds: config.parse_option("activeDeadlineSeconds")?,
        })
    }
}

/// Job id carried by a payload: `jobId` or a stage-specific `<stage>JobId`.
pub fn payload_job_id(payload: &serde_json::Value) -> Option<i64> {
    payload.as_object()?.iter().find_map(|(key, value)| {
        (key == "jobId" || key.ends_with("JobId"))
            .then(|| value.as_i64())
            .flatten()
    })
}

/// Make a string usable as a label value: at most 63 characters of
/// `[A-Za-z0-9._-]`, starting and ending alphanumeric.
pub fn sanitize_label_value(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(63)
        .collect();

    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Build the Job that carries `message` to the worker of `endpoint`.
pub fn build_job(
    endpoint: EndpointName,
    config: &KubernetesSenderConfig,
    message: &WireMessage,
) -> anyhow::Result<Job> {
    let job_id = payload_job_id(&message.payload);
    let name = match job_id {
        Some(id) => format!("{endpoint}-{id}-{}", short_id()),
        None => format!("{endpoint}-{}", short_id()),
    };

    let mut labels = BTreeMap::from([(WORKER_LABEL.to_string(), endpoint.to_string())]);
    if let Some(id) = job_id {
        labels.insert(JOB_ID_LABEL.to_string(), id.to_string());
    }
    let trace_label = sanitize_label_value(&message.header.trace_id);
    if !trace_label.is_empty() {
        labels.insert(TRACE_ID_LABEL.to_string(), trace_label);
    }

    let payload = serde_json::to_string(&message.payload).context("serializing payload")?;
    let env = [
        (TOKEN_VAR, message.header.token.clone()),
        (TRACE_ID_VAR, message.header.trace_id.clone()),
        (PAYLOAD_VAR, payload),
    ]
    .into_iter()
    .map(|(name, value)| EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    })
    .collect();

    let container = Container {
        name: endpoint.to_string(),
        image: Some(config.image_name.clone()),
        image_pull_policy: config.image_pull_policy.clone(),
        command: (!config.command.is_empty()).then(|| config.command.clone()),
        args: (!config.args.is_empty()).then(|| config.args.clone()),
        env: Some(env),
        ..Default::default()
    };

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: config.backoff_limit,
            ttl_seconds_after_finished: config.ttl_seconds_after_finished,
            active_deadline_seconds: config.active_deadline_seconds,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("Never".to_string()),
                    service_account_name: config.service_account.clone(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Sender creating one Job per message.
#[derive(Clone)]
pub struct KubernetesSender {
    api: Api<Job>,
    endpoint: EndpointName,
    config: KubernetesSenderConfig,
}

impl KubernetesSender {
    pub fn new(client: Client, endpoint: EndpointName, config: KubernetesSenderConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            endpoint,
            config,
        }
    }
}

#[async_trait]
impl SenderBackend for KubernetesSender {
    async fn send(&self, message: &WireMessage) -> anyhow::Result<()> {
        let job = build_job(self.endpoint, &self.config, message)?;
        let created = self
            .api
            .create(&PostParams::default(), &job)
            .await
            .with_context(|| format!("creating job in namespace '{}'", self.config.namespace))?;

        tracing::info!(
            endpoint = %self.endpoint,
            trace_id = %message.header.trace_id,
            job_name = created.metadata.name.as_deref().unwrap_or_default(),
            "created kubernetes job"
        );
        Ok(())
    }
}

/// Read the message handed to this pod through its environment.
pub fn message_from_env<F>(lookup: F) -> anyhow::Result<WireMessage>
where
    F: Fn(&str) -> Option<String>,
{
    let payload = lookup(PAYLOAD_VAR)
        .ok_or_else(|| anyhow::anyhow!("environment variable '{PAYLOAD_VAR}' is not set"))?;
    let payload = serde_json::from_str(&payload)
        .with_context(|| format!("environment variable '{PAYLOAD_VAR}' is not valid JSON"))?;

    Ok(WireMessage {
        header: MessageHeader::new(
            lookup(TOKEN_VAR).unwrap_or_default(),
            lookup(TRACE_ID_VAR).unwrap_or_default(),
        ),
        payload,
    })
}

/// Worker-side receiver delivering the single message of this pod.
#[derive(Clone, Debug)]
pub struct KubernetesReceiver {
    endpoint: EndpointName,
    message: WireMessage,
}

impl KubernetesReceiver {
    pub fn new(endpoint: EndpointName, message: WireMessage) -> Self {
        Self { endpoint, message }
    }

    pub fn from_env(endpoint: EndpointName) -> anyhow::Result<Self> {
        Ok(Self::new(
            endpoint,
            message_from_env(|name| std::env::var(name).ok())?,
        ))
    }
}

#[async_trait]
impl ReceiverBackend for KubernetesReceiver {
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<ReceiverHandle> {
        let endpoint = self.endpoint;
        let message = self.message.clone();
        let trace_id = message.header.trace_id.clone();

        let task = tokio::spawn(async move {
            // No redelivery here: any error, including a reported job
            // failure, becomes the pod's exit status.
            let result = handler.handle(message).await;
            match &result {
                Err(err) if JobFailed::is_reported(err) => {
                    tracing::warn!(%endpoint, %trace_id, "{err:#}");
                }
                Err(err) => {
                    tracing::error!(%endpoint, %trace_id, "handling job message failed: {err:#}");
                }
                Ok(()) => {}
            }
            result
        });

        Ok(ReceiverHandle::new(endpoint, ShutdownToken::new(), task))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct KubernetesSenderFactory;

#[async_trait]
impl SenderFactory for KubernetesSenderFactory {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn create_sender(&self, config: &BackendConfig) -> anyhow::Result<Arc<dyn SenderBackend>> {
        let sender_config = KubernetesSenderConfig::from_backend_config(config)?;
        let client = Client::try_default()
            .await
            .context("failed to create kubernetes client")?;
        Ok(Arc::new(KubernetesSender::new(client, config.endpoint, sender_config)))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct KubernetesReceiverFactory;

#[async_trait]
impl ReceiverFactory for KubernetesReceiverFactory {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn create_receiver(
        &self,
        config: &BackendConfig,
    ) -> anyhow::Result<Arc<dyn ReceiverBackend>> {
        Ok(Arc::new(KubernetesReceiver::from_env(config.endpoint)?))
    }
}
