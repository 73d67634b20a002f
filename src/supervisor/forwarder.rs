//! Relaying one inference request to the ready server.

use super::launcher::ServerHandle;
use crate::config::Config;
use crate::error::{Result, SupervisorError};
use crate::protocol::{CompletionRequest, InferenceRequest};
use reqwest::Client;
use serde::de::IgnoredAny;
use std::time::Duration;
use tracing::debug;

/// Sends completion requests with the configured sampling defaults.
pub struct Forwarder {
    client: Client,
    timeout: Duration,
    temperature: f32,
    top_p: f32,
}

impl Forwarder {
    pub fn new(temperature: f32, top_p: f32, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().build()?,
            timeout,
            temperature,
            top_p,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.server.temperature,
            config.server.top_p,
            config.forwarder.request_timeout(),
        )
    }

    /// Build the `/completion` body for a request.
    pub fn completion_body(&self, request: &InferenceRequest) -> CompletionRequest {
        CompletionRequest {
            prompt: request.prompt.clone(),
            n_predict: request.n_predict,
            temperature: Some(request.temperature.unwrap_or(self.temperature)),
            top_p: Some(request.top_p.unwrap_or(self.top_p)),
            stream: Some(false),
        }
    }

    /// Forward `request` and return the server's payload unchanged.
    ///
    /// The body is checked to be JSON but relayed byte for byte.
    pub async fn infer(&self, handle: &ServerHandle, request: &InferenceRequest) -> Result<String> {
        if !handle.is_ready() {
            return Err(SupervisorError::NotReady);
        }

        let url = format!("{}/completion", handle.base_url());
        debug!("Forwarding completion request to {}", url);

        let response = self
            .client
            .post(&url)
            .json(&self.completion_body(request))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(upstream)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SupervisorError::UpstreamStatus { status, body });
        }

        let payload = response.text().await.map_err(upstream)?;
        serde_json::from_str::<IgnoredAny>(&payload)
            .map_err(|e| SupervisorError::InvalidPayload(e.to_string()))?;
        Ok(payload)
    }
}

fn upstream(err: reqwest::Error) -> SupervisorError {
    if err.is_timeout() {
        SupervisorError::UpstreamTimeout
    } else {
        SupervisorError::Http(err)
    }
}
