//! Two-phase readiness probing.
//!
//! llama-server's `/health` endpoint can report healthy (or keep reporting
//! 503) while weights are still being mapped, so a one-token completion is
//! used as the ground truth. Phase one polls `/health` and escalates to a
//! completion probe on 503; phase two polls the completion endpoint alone.
//! Every probe timeout and every sleep is clipped to the remaining budget.

use crate::config::ReadinessConfig;
use crate::error::{Result, SupervisorError};
use crate::protocol::CompletionRequest;
use async_trait::async_trait;
use reqwest::Client;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// What a single probe observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The server answered with this status and body.
    Status { code: u16, body: String },
    /// Nothing is listening yet.
    Refused,
    /// The probe exceeded its own timeout.
    TimedOut,
    /// Any other transport failure.
    Failed(String),
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Status { code, .. } => write!(f, "status {}", code),
            ProbeOutcome::Refused => write!(f, "connection refused"),
            ProbeOutcome::TimedOut => write!(f, "timed out"),
            ProbeOutcome::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

/// Source of readiness signals.
#[async_trait]
pub trait Probe: Send + Sync {
    /// `GET /health`.
    async fn health(&self, timeout: Duration) -> ProbeOutcome;

    /// A one-token `POST /completion`.
    async fn test_completion(&self, timeout: Duration) -> ProbeOutcome;
}

/// Probes a llama-server over HTTP.
pub struct HttpProbe {
    client: Client,
    base_url: String,
}

impl HttpProbe {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: Client::builder().build()?,
            base_url: base_url.into(),
        })
    }

    async fn outcome(response: reqwest::Result<reqwest::Response>) -> ProbeOutcome {
        match response {
            Ok(response) => {
                let code = response.status().as_u16();
                match response.text().await {
                    Ok(body) => ProbeOutcome::Status { code, body },
                    Err(e) => classify(e),
                }
            }
            Err(e) => classify(e),
        }
    }
}

fn classify(err: reqwest::Error) -> ProbeOutcome {
    if err.is_timeout() {
        ProbeOutcome::TimedOut
    } else if err.is_connect() {
        ProbeOutcome::Refused
    } else {
        ProbeOutcome::Failed(err.to_string())
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn health(&self, timeout: Duration) -> ProbeOutcome {
        let url = format!("{}/health", self.base_url);
        Self::outcome(self.client.get(&url).timeout(timeout).send().await).await
    }

    async fn test_completion(&self, timeout: Duration) -> ProbeOutcome {
        let url = format!("{}/completion", self.base_url);
        Self::outcome(
            self.client
                .post(&url)
                .json(&CompletionRequest::probe())
                .timeout(timeout)
                .send()
                .await,
        )
        .await
    }
}

/// Timing of [`wait_ready`].
#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    pub max_wait: Duration,
    pub health_phase: Duration,
    pub health_interval: Duration,
    pub completion_interval: Duration,
    pub health_timeout: Duration,
    pub completion_timeout: Duration,
    pub loading_marker: String,
}

impl From<&ReadinessConfig> for ReadinessPolicy {
    fn from(config: &ReadinessConfig) -> Self {
        Self {
            max_wait: Duration::from_secs(config.max_wait_secs),
            health_phase: Duration::from_secs(config.health_phase_secs),
            health_interval: Duration::from_secs(config.health_interval_secs),
            completion_interval: Duration::from_secs(config.completion_interval_secs),
            health_timeout: Duration::from_secs(config.health_timeout_secs),
            completion_timeout: Duration::from_secs(config.completion_timeout_secs),
            loading_marker: config.loading_marker.clone(),
        }
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self::from(&ReadinessConfig::default())
    }
}

fn remaining(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|d| !d.is_zero())
}

async fn pause(interval: Duration, deadline: Instant) {
    let wake = (Instant::now() + interval).min(deadline);
    tokio::time::sleep_until(wake).await;
}

/// Block until the server declares readiness or the budget runs out.
///
/// Returns the time it took.
pub async fn wait_ready<P>(probe: &P, policy: &ReadinessPolicy) -> Result<Duration>
where
    P: Probe + ?Sized,
{
    let start = Instant::now();
    let deadline = start + policy.max_wait;
    let health_deadline = start + policy.health_phase.min(policy.max_wait);
    let mut attempt: u32 = 0;

    info!(
        "Waiting for server to be ready (max {} seconds)...",
        policy.max_wait.as_secs()
    );

    while let Some(left) = remaining(health_deadline) {
        attempt += 1;
        let elapsed = start.elapsed().as_secs();
        if attempt % 10 == 1 {
            info!("Health check attempt {}, elapsed: {}s", attempt, elapsed);
        }

        match probe.health(policy.health_timeout.min(left)).await {
            ProbeOutcome::Status { code: 200, .. } => {
                info!("Server is ready! Took {} seconds", start.elapsed().as_secs());
                return Ok(start.elapsed());
            }
            ProbeOutcome::Status { code: 503, .. } => {
                info!("Server returned 503, testing completion endpoint...");
                let left = remaining(deadline).unwrap_or_default();
                match probe
                    .test_completion(policy.completion_timeout.min(left))
                    .await
                {
                    ProbeOutcome::Status { code: 200, .. } => {
                        info!(
                            "Server is ready via completion test! Took {} seconds",
                            start.elapsed().as_secs()
                        );
                        return Ok(start.elapsed());
                    }
                    ProbeOutcome::Status { code, .. } => {
                        info!("Completion test returned status {}", code)
                    }
                    other => info!("Completion test failed: {}", other),
                }
            }
            ProbeOutcome::Status { code, .. } => {
                info!("Health check returned status {}", code)
            }
            ProbeOutcome::Refused => {
                info!("Connection refused, server still starting... (elapsed: {}s)", elapsed)
            }
            ProbeOutcome::TimedOut => warn!(
                "Health check timed out after {} seconds (attempt {})",
                policy.health_timeout.as_secs(),
                attempt
            ),
            ProbeOutcome::Failed(msg) => warn!("Health check error: {}", msg),
        }

        pause(policy.health_interval, health_deadline).await;
    }

    if remaining(deadline).is_some() {
        info!("Health check did not report ready, trying completion endpoint...");
    }

    while let Some(left) = remaining(deadline) {
        attempt += 1;
        let elapsed = start.elapsed().as_secs();

        match probe
            .test_completion(policy.completion_timeout.min(left))
            .await
        {
            ProbeOutcome::Status { code: 200, .. } => {
                info!(
                    "Server is ready via completion endpoint! Took {} seconds",
                    start.elapsed().as_secs()
                );
                return Ok(start.elapsed());
            }
            ProbeOutcome::Status { code: 503, body } if !body.contains(&policy.loading_marker) => {
                info!(
                    "Server is ready (completion test passed)! Took {} seconds",
                    start.elapsed().as_secs()
                );
                return Ok(start.elapsed());
            }
            ProbeOutcome::Status { code: 503, .. } => {
                info!("Server still loading model... (elapsed: {}s)", elapsed)
            }
            ProbeOutcome::Status { code, .. } => {
                info!("Completion test returned status {}", code)
            }
            ProbeOutcome::Refused => {
                info!("Connection refused, server still starting... (elapsed: {}s)", elapsed)
            }
            ProbeOutcome::TimedOut => {
                warn!("Completion test timed out (elapsed: {}s)", elapsed)
            }
            ProbeOutcome::Failed(msg) => warn!("Completion test error: {}", msg),
        }

        pause(policy.completion_interval, deadline).await;
    }

    error!(
        "Server failed to start within {} seconds",
        policy.max_wait.as_secs()
    );
    Err(SupervisorError::ReadyTimeout(policy.max_wait.as_secs()))
}
