//! In-process broker for tests and single-process deployments.
//!
//! Registered under the name `testing`. Messages are removed from their
//! queue while a handler runs and put back with a backoff delay if it fails,
//! until the redelivery policy moves them to the dead-letter list.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{
    EndpointName, MessageHandler, ReceiverBackend, ReceiverFactory, ReceiverHandle,
    Redelivery, RedeliveryPolicy, SenderBackend, SenderFactory, WireMessage,
};
use crate::config::BackendConfig;
use crate::error::JobFailed;
use crate::runtime::ShutdownToken;

pub const BACKEND_NAME: &str = "testing";

/// Upper bound on how long an idle receiver sleeps before re-checking.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// A message that exhausted its delivery attempts.
#[derive(Clone, Debug)]
pub struct DeadLetter {
    pub message: WireMessage,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Debug)]
struct Delivery {
    message: WireMessage,
    attempts: u32,
    available_at: Instant,
}

#[derive(Debug, Default)]
struct EndpointQueue {
    pending: VecDeque<Delivery>,
    dead_letters: Vec<DeadLetter>,
    notify: Arc<Notify>,
}

#[derive(Debug)]
struct BrokerInner {
    queues: Mutex<HashMap<EndpointName, EndpointQueue>>,
    policy: RedeliveryPolicy,
}

/// Shared in-memory message broker.
#[derive(Clone, Debug)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(RedeliveryPolicy::default())
    }
}

/// Result of handing one ready message to a handler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeliveryOutcome {
    Acked,
    Requeued,
    DeadLettered,
}

impl InMemoryBroker {
    pub fn new(policy: RedeliveryPolicy) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: Mutex::new(HashMap::new()),
                policy,
            }),
        }
    }

    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.inner.policy
    }

    pub fn publish(&self, endpoint: EndpointName, message: WireMessage) {
        let notify = {
            let mut queues = self.inner.queues.lock();
            let queue = queues.entry(endpoint).or_default();
            queue.pending.push_back(Delivery {
                message,
                attempts: 0,
                available_at: Instant::now(),
            });
            Arc::clone(&queue.notify)
        };
        notify.notify_one();
    }

    /// Remove and return every pending message of an endpoint.
    pub fn take_messages(&self, endpoint: EndpointName) -> Vec<WireMessage> {
        let mut queues = self.inner.queues.lock();
        queues
            .get_mut(&endpoint)
            .map(|queue| queue.pending.drain(..).map(|d| d.message).collect())
            .unwrap_or_default()
    }

    /// Number of messages waiting on an endpoint, including delayed ones.
    pub fn pending_count(&self, endpoint: EndpointName) -> usize {
        self.inner
            .queues
            .lock()
            .get(&endpoint)
            .map_or(0, |queue| queue.pending.len())
    }

    pub fn dead_letters(&self, endpoint: EndpointName) -> Vec<DeadLetter> {
        self.inner
            .queues
            .lock()
            .get(&endpoint)
            .map(|queue| queue.dead_letters.clone())
            .unwrap_or_default()
    }

    fn notifier(&self, endpoint: EndpointName) -> Arc<Notify> {
        let mut queues = self.inner.queues.lock();
        Arc::clone(&queues.entry(endpoint).or_default().notify)
    }

    /// Pop the first message that is due. Otherwise return how long until
    /// the next delayed one becomes due, if any.
    fn next_ready(&self, endpoint: EndpointName) -> Result<Delivery, Option<Duration>> {
        let mut queues = self.inner.queues.lock();
        let Some(queue) = queues.get_mut(&endpoint) else {
            return Err(None);
        };

        let now = Instant::now();
        if let Some(pos) = queue.pending.iter().position(|d| d.available_at <= now) {
            if let Some(delivery) = queue.pending.remove(pos) {
                return Ok(delivery);
            }
        }

        Err(queue
            .pending
            .iter()
            .map(|d| d.available_at.saturating_duration_since(now))
            .min())
    }

    async fn deliver(
        &self,
        endpoint: EndpointName,
        mut delivery: Delivery,
        handler: &dyn MessageHandler,
    ) -> DeliveryOutcome {
        delivery.attempts += 1;

        let err = match handler.handle(delivery.message.clone()).await {
            Ok(()) => return DeliveryOutcome::Acked,
            Err(err) if JobFailed::is_reported(&err) => {
                tracing::debug!(%endpoint, "{err:#}");
                return DeliveryOutcome::Acked;
            }
            Err(err) => err,
        };

        let mut queues = self.inner.queues.lock();
        let queue = queues.entry(endpoint).or_default();
        match self.inner.policy.decide(delivery.attempts) {
            Redelivery::Retry { delay } => {
                tracing::warn!(
                    %endpoint,
                    trace_id = %delivery.message.header.trace_id,
                    attempts = delivery.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "handler failed, message requeued: {err:#}"
                );
                delivery.available_at = Instant::now() + delay;
                queue.pending.push_back(delivery);
                queue.notify.notify_one();
                DeliveryOutcome::Requeued
            }
            Redelivery::DeadLetter => {
                tracing::error!(
                    %endpoint,
                    trace_id = %delivery.message.header.trace_id,
                    attempts = delivery.attempts,
                    "handler failed, message dead-lettered: {err:#}"
                );
                queue.dead_letters.push(DeadLetter {
                    message: delivery.message,
                    attempts: delivery.attempts,
                    last_error: format!("{err:#}"),
                });
                DeliveryOutcome::DeadLettered
            }
        }
    }

    /// Deliver every message that is due right now, one at a time, and
    /// return what happened to each. Messages requeued with a zero delay
    /// are retried within the same call.
    pub async fn drain(
        &self,
        endpoint: EndpointName,
        handler: &dyn MessageHandler,
    ) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(delivery) = self.next_ready(endpoint) {
            outcomes.push(self.deliver(endpoint, delivery, handler).await);
        }
        outcomes
    }

    async fn receive_loop(
        self,
        endpoint: EndpointName,
        handler: Arc<dyn MessageHandler>,
        shutdown: ShutdownToken,
    ) -> anyhow::Result<()> {
        let notify = self.notifier(endpoint);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.next_ready(endpoint) {
                Ok(delivery) => {
                    self.deliver(endpoint, delivery, handler.as_ref()).await;
                }
                Err(wait) => {
                    let wait = wait.unwrap_or(IDLE_POLL).min(IDLE_POLL);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        tracing::debug!(%endpoint, "in-memory receiver stopped");
        Ok(())
    }
}

/// Sender bound to one endpoint of an [`InMemoryBroker`].
#[derive(Clone, Debug)]
pub struct InMemorySender {
    broker: InMemoryBroker,
    endpoint: EndpointName,
}

impl InMemorySender {
    pub fn new(broker: InMemoryBroker, endpoint: EndpointName) -> Self {
        Self { broker, endpoint }
    }
}

#[async_trait]
impl SenderBackend for InMemorySender {
    async fn send(&self, message: &WireMessage) -> anyhow::Result<()> {
        self.broker.publish(self.endpoint, message.clone());
        Ok(())
    }
}

/// Receiver bound to one endpoint of an [`InMemoryBroker`].
#[derive(Clone, Debug)]
pub struct InMemoryReceiver {
    broker: InMemoryBroker,
    endpoint: EndpointName,
}

impl InMemoryReceiver {
    pub fn new(broker: InMemoryBroker, endpoint: EndpointName) -> Self {
        Self { broker, endpoint }
    }
}

#[async_trait]
impl ReceiverBackend for InMemoryReceiver {
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<ReceiverHandle> {
        let shutdown = ShutdownToken::new();
        let task = tokio::spawn(self.broker.clone().receive_loop(
            self.endpoint,
            handler,
            shutdown.clone(),
        ));
        Ok(ReceiverHandle::new(self.endpoint, shutdown, task))
    }
}

/// Factory registering the broker under [`BACKEND_NAME`].
#[derive(Clone, Debug)]
pub struct InMemoryFactory {
    broker: InMemoryBroker,
}

impl InMemoryFactory {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl SenderFactory for InMemoryFactory {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn create_sender(&self, config: &BackendConfig) -> anyhow::Result<Arc<dyn SenderBackend>> {
        Ok(Arc::new(InMemorySender::new(self.broker.clone(), config.endpoint)))
    }
}

#[async_trait]
impl ReceiverFactory for InMemoryFactory {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn create_receiver(
        &self,
        config: &BackendConfig,
    ) -> anyhow::Result<Arc<dyn ReceiverBackend>> {
        Ok(Arc::new(InMemoryReceiver::new(self.broker.clone(), config.endpoint)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;
    use crate::message::MessageHeader;
    use crate::stage::Stage;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyHandler {
        failures_left: AtomicU32,
        handled: AtomicU32,
    }

    impl FlakyHandler {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                handled: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        async fn handle(&self, _message: WireMessage) -> anyhow::Result<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("transient failure");
            }
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn message(n: i64) -> WireMessage {
        WireMessage {
            header: MessageHeader::new("", format!("trace-{n}")),
            payload: serde_json::json!({"kind": "AnalyzerRequest", "analyzerJobId": n}),
        }
    }

    fn immediate_policy(max_attempts: u32) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_attempts,
            base_delay_ms: 0,
            max_backoff_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried() {
        let broker = InMemoryBroker::new(immediate_policy(5));
        broker.publish(EndpointName::Analyzer, message(1));
        let handler = FlakyHandler::new(2);

        let outcomes = broker.drain(EndpointName::Analyzer, &handler).await;

        assert_eq!(
            outcomes,
            vec![
                DeliveryOutcome::Requeued,
                DeliveryOutcome::Requeued,
                DeliveryOutcome::Acked
            ]
        );
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        assert_eq!(broker.pending_count(EndpointName::Analyzer), 0);
    }

    #[tokio::test]
    async fn test_exhausted_message_is_dead_lettered() {
        let broker = InMemoryBroker::new(immediate_policy(3));
        broker.publish(EndpointName::Analyzer, message(1));
        let handler = FlakyHandler::new(u32::MAX);

        let outcomes = broker.drain(EndpointName::Analyzer, &handler).await;

        assert_eq!(outcomes.last(), Some(&DeliveryOutcome::DeadLettered));
        let dead = broker.dead_letters(EndpointName::Analyzer);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert!(dead[0].last_error.contains("transient failure"));
    }

    struct FailedJobHandler;

    #[async_trait]
    impl MessageHandler for FailedJobHandler {
        async fn handle(&self, _message: WireMessage) -> anyhow::Result<()> {
            Err(JobFailed {
                stage: Stage::Analyzer,
                job_id: JobId(1),
                cause: "analysis failed".to_string(),
            }
            .into())
        }
    }

    #[tokio::test]
    async fn test_reported_job_failure_is_acked() {
        let broker = InMemoryBroker::new(immediate_policy(3));
        broker.publish(EndpointName::Analyzer, message(1));

        let outcomes = broker.drain(EndpointName::Analyzer, &FailedJobHandler).await;

        assert_eq!(outcomes, vec![DeliveryOutcome::Acked]);
        assert!(broker.dead_letters(EndpointName::Analyzer).is_empty());
        assert_eq!(broker.pending_count(EndpointName::Analyzer), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeued_message_waits_for_backoff() {
        let broker = InMemoryBroker::new(RedeliveryPolicy {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_backoff_ms: 1000,
        });
        broker.publish(EndpointName::Analyzer, message(1));
        let handler = FlakyHandler::new(1);

        let first = broker.drain(EndpointName::Analyzer, &handler).await;
        assert_eq!(first, vec![DeliveryOutcome::Requeued]);
        assert_eq!(broker.pending_count(EndpointName::Analyzer), 1);

        tokio::time::advance(Duration::from_millis(1001)).await;
        let second = broker.drain(EndpointName::Analyzer, &handler).await;
        assert_eq!(second, vec![DeliveryOutcome::Acked]);
    }

    #[tokio::test]
    async fn test_receiver_loop_delivers_and_stops() {
        let broker = InMemoryBroker::new(immediate_policy(3));
        let handler = Arc::new(FlakyHandler::new(0));
        let receiver = InMemoryReceiver::new(broker.clone(), EndpointName::Scanner);
        let handle = receiver.start(handler.clone()).await.unwrap();

        let sender = InMemorySender::new(broker.clone(), EndpointName::Scanner);
        for n in 0..3 {
            sender.send(&message(n)).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.handled.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("messages were not delivered");

        handle.stop().await.unwrap();
        assert_eq!(broker.pending_count(EndpointName::Scanner), 0);
    }

    #[tokio::test]
    async fn test_take_messages_drains_queue() {
        let broker = InMemoryBroker::default();
        broker.publish(EndpointName::Advisor, message(1));
        broker.publish(EndpointName::Advisor, message(2));

        let taken = broker.take_messages(EndpointName::Advisor);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0], message(1));
        assert!(broker.take_messages(EndpointName::Advisor).is_empty());
        assert!(broker.take_messages(EndpointName::Reporter).is_empty());
    }
}
