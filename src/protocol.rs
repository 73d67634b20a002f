//! Wire types for invocations and for the llama-server HTTP API.
//!
//! Inbound events are loose JSON; everything past validation is strongly typed.

use crate::error::{Result, SupervisorError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message returned when an event carries no usable prompt.
pub const MISSING_PROMPT: &str = "Missing required parameter: prompt";

/// A validated inference request.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub prompt: String,
    /// Tokens to generate. `-1` lets the server run until a stop condition.
    pub n_predict: i32,
    /// Overrides the configured sampling temperature.
    pub temperature: Option<f32>,
    /// Overrides the configured nucleus-sampling threshold.
    pub top_p: Option<f32>,
}

/// Raw shape of an inbound event before validation.
#[derive(Debug, Default, Deserialize)]
struct RawEvent {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    n_predict: Option<i32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
}

impl InferenceRequest {
    /// Decode and validate an invocation event.
    ///
    /// Accepts the event object itself, a JSON string containing it, or a
    /// proxy-style event whose `body` field is such a string.
    pub fn from_event(event: Value, default_n_predict: i32) -> Result<Self> {
        let event = unwrap_event(event)?;
        let raw: RawEvent = serde_json::from_value(event)
            .map_err(|e| SupervisorError::Validation(format!("Invalid request: {}", e)))?;

        let prompt = raw.prompt.unwrap_or_default();
        if prompt.is_empty() {
            return Err(SupervisorError::Validation(MISSING_PROMPT.to_string()));
        }

        Ok(Self {
            prompt,
            n_predict: raw.n_predict.unwrap_or(default_n_predict),
            temperature: raw.temperature,
            top_p: raw.top_p,
        })
    }
}

fn unwrap_event(event: Value) -> Result<Value> {
    match event {
        Value::String(s) => parse_embedded(&s),
        Value::Object(ref map) if !map.contains_key("prompt") => match map.get("body") {
            Some(Value::String(body)) => parse_embedded(body),
            _ => Ok(event),
        },
        other => Ok(other),
    }
}

fn parse_embedded(s: &str) -> Result<Value> {
    serde_json::from_str(s)
        .map_err(|e| SupervisorError::Validation(format!("Invalid request body: {}", e)))
}

/// Body of `POST /completion`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub n_predict: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl CompletionRequest {
    /// The one-token request used as a readiness signal.
    pub fn probe() -> Self {
        Self {
            prompt: "test".to_string(),
            n_predict: 1,
            temperature: None,
            top_p: None,
            stream: None,
        }
    }
}

/// Response returned to the invoking host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    /// JSON-encoded payload.
    pub body: String,
}

impl InvocationResponse {
    /// Create a successful response carrying the completion payload as
    /// the server encoded it.
    pub fn success(payload: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            body: payload.into(),
        }
    }

    /// Create an error response.
    pub fn error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            body: serde_json::json!({ "error": message.into() }).to_string(),
        }
    }
}

impl From<&SupervisorError> for InvocationResponse {
    fn from(err: &SupervisorError) -> Self {
        Self::error(err.status_code(), err.to_string())
    }
}
