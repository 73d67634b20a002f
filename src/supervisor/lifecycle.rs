//! Ownership of the single inference server across invocations.

use super::forwarder::Forwarder;
use super::launcher::{HandleInfo, Launcher, ProcessLauncher, ServerHandle};
use super::probe::{wait_ready, HttpProbe, ReadinessPolicy};
use crate::config::Config;
use crate::error::{Result, SupervisorError};
use crate::protocol::InferenceRequest;
use std::future::Future;
use std::sync::PoisonError;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lazily starts the inference server and keeps it alive for reuse.
///
/// The slot's mutex is both the single-initialization barrier and the
/// guarantee that at most one request is in flight per server. The stop
/// token lives outside it so [`shutdown`](Self::shutdown) never queues
/// behind a request.
pub struct Supervisor {
    config: Config,
    launcher: Box<dyn Launcher>,
    forwarder: Forwarder,
    policy: ReadinessPolicy,
    slot: Mutex<Option<ServerHandle>>,
    stop: std::sync::Mutex<CancellationToken>,
}

impl Supervisor {
    /// Create a supervisor that launches the configured binary.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_launcher(config, Box::new(ProcessLauncher))
    }

    pub fn with_launcher(config: Config, launcher: Box<dyn Launcher>) -> Result<Self> {
        let forwarder = Forwarder::from_config(&config)?;
        let policy = ReadinessPolicy::from(&config.readiness);
        Ok(Self {
            config,
            launcher,
            forwarder,
            policy,
            slot: Mutex::new(None),
            stop: std::sync::Mutex::new(CancellationToken::new()),
        })
    }

    /// Replace the readiness timing derived from configuration.
    pub fn with_policy(mut self, policy: ReadinessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Return the running server, starting it first if needed.
    pub async fn get_or_create(&self) -> Result<HandleInfo> {
        self.unless_stopped(async {
            let mut slot = self.slot.lock().await;
            let handle = self.ensure(&mut slot).await?;
            Ok(handle.info())
        })
        .await
    }

    /// Forward a request to the server, starting it first if needed.
    ///
    /// Returns the server's JSON payload as received.
    pub async fn infer(&self, request: &InferenceRequest) -> Result<String> {
        self.unless_stopped(async {
            let mut slot = self.slot.lock().await;
            let handle = self.ensure(&mut slot).await?;
            self.forwarder.infer(handle, request).await
        })
        .await
    }

    /// Whether a ready server is currently held.
    #[cfg(test)]
    pub async fn is_running(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Stop the server, if any. Safe to call more than once.
    ///
    /// Calls in progress are abandoned with [`SupervisorError::ShuttingDown`]
    /// so the slot is released promptly. A server that was still starting is
    /// killed when its handle drops.
    pub async fn shutdown(&self) {
        {
            let mut stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner);
            stop.cancel();
            *stop = CancellationToken::new();
        }

        let handle = self.slot.lock().await.take();
        if let Some(handle) = handle {
            info!("Shutting down inference server...");
            handle.terminate(self.config.server.shutdown_grace()).await;
        }
    }

    async fn unless_stopped<T, F>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner).clone();
        tokio::select! {
            biased;
            _ = stop.cancelled() => Err(SupervisorError::ShuttingDown),
            result = work => result,
        }
    }

    async fn ensure<'a>(&self, slot: &'a mut Option<ServerHandle>) -> Result<&'a ServerHandle> {
        if slot.as_mut().is_some_and(ServerHandle::has_exited) {
            warn!("Inference server is no longer running, relaunching");
            if let Some(stale) = slot.take() {
                stale.terminate(Duration::ZERO).await;
            }
        }

        let handle = match slot.take() {
            Some(handle) => handle,
            None => self.start().await?,
        };
        Ok(slot.insert(handle))
    }

    async fn start(&self) -> Result<ServerHandle> {
        let mut handle = self.launcher.launch(&self.config.server)?;
        let probe = HttpProbe::new(handle.base_url())?;
        match wait_ready(&probe, &self.policy).await {
            Ok(elapsed) => {
                handle.mark_ready();
                info!(
                    "Inference server started successfully in {}s",
                    elapsed.as_secs()
                );
                Ok(handle)
            }
            Err(e) => {
                error!("Failed to start inference server: {}", e);
                handle.terminate(Duration::ZERO).await;
                Err(e)
            }
        }
    }
}
