use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::config::OrchestratorConfig;
use crate::orchestrator::Orchestrator;
use crate::transport::{OrchestratorEndpoint, ReceiverBackend, ReceiverHandle, start_receiver};

/// Time each background task gets to wind down during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Token for signaling graceful shutdown to background loops.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();

        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Hosts an [`Orchestrator`]: its receiver loop on the orchestrator endpoint
/// and the periodic recovery sweep.
pub struct OrchestratorRuntime {
    config: OrchestratorConfig,
    orchestrator: Arc<Orchestrator>,
    receiver: Arc<dyn ReceiverBackend>,
    shutdown_token: ShutdownToken,
    receiver_handle: Mutex<Option<ReceiverHandle>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for OrchestratorRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let receiving = self
            .receiver_handle
            .try_lock()
            .map(|handle| handle.is_some())
            .unwrap_or_default();
        let worker_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("OrchestratorRuntime")
            .field("config", &self.config)
            .field("receiving", &receiving)
            .field("worker_count", &worker_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl OrchestratorRuntime {
    pub fn new(
        config: OrchestratorConfig,
        orchestrator: Arc<Orchestrator>,
        receiver: Arc<dyn ReceiverBackend>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            receiver,
            shutdown_token: ShutdownToken::new(),
            receiver_handle: Mutex::new(None),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Start receiving orchestrator messages and the recovery housekeeper.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut receiver_handle = self.receiver_handle.lock().await;
        if receiver_handle.is_some() {
            anyhow::bail!("orchestrator runtime already started");
        }

        let handle = start_receiver::<OrchestratorEndpoint, _>(
            self.receiver.as_ref(),
            Arc::clone(&self.orchestrator),
        )
        .await?;
        *receiver_handle = Some(handle);
        drop(receiver_handle);

        self.spawn_housekeeper().await;
        tracing::info!("orchestrator runtime started");
        Ok(())
    }

    /// Spawn the task running [`Orchestrator::recover_pending`] on the
    /// configured interval.
    pub async fn spawn_housekeeper(&self) {
        let orchestrator = self.orchestrator();
        let interval = self.config.recovery_interval;
        let grace = self.config.recovery_grace;
        let shutdown = self.shutdown_token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = orchestrator.recover_pending(grace).await {
                            tracing::warn!("housekeeper recover_pending error: {err}");
                        }
                    }
                }
            }
        });

        self.worker_handles.lock().await.push(handle);
    }

    /// Gracefully shut down the receiver and background tasks.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of orchestrator runtime");

        self.shutdown_token.cancel();

        if let Some(handle) = self.receiver_handle.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle.stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Receiver stopped with error: {e:#}"),
                Err(_) => tracing::warn!("Receiver timed out during shutdown"),
            }
        }

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Background task failed: {:?}", e),
                Err(_) => {
                    tracing::warn!("Background task timed out during shutdown")
                }
            }
        }

        tracing::info!("Orchestrator runtime shutdown complete");
        Ok(())
    }
}
