//! Error kinds for the supervisor and the invocation boundary.

use thiserror::Error;

/// Errors raised while launching, probing or forwarding to the inference server.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The subprocess could not be started.
    #[error("Failed to launch inference server: {0}")]
    Launch(String),

    /// The subprocess did not become ready within the wait budget.
    #[error("Server failed to start within {0} seconds")]
    ReadyTimeout(u64),

    /// Inference was attempted before readiness was declared.
    #[error("Server is not ready")]
    NotReady,

    /// The subprocess answered with a non-success status.
    #[error("Server returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    /// The inference call exceeded its timeout.
    #[error("Request timed out")]
    UpstreamTimeout,

    /// The subprocess answered 2xx with a body that is not JSON.
    #[error("Server returned an invalid payload: {0}")]
    InvalidPayload(String),

    /// The supervisor was stopped while the call was in progress.
    #[error("Server is shutting down")]
    ShuttingDown,

    /// The inbound request was malformed.
    #[error("{0}")]
    Validation(String),

    /// Any other transport failure talking to the subprocess.
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl SupervisorError {
    /// Status code reported to the caller for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            SupervisorError::Validation(_) => 400,
            _ => 500,
        }
    }

    /// Stable, machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorError::Launch(_) => "LaunchError",
            SupervisorError::ReadyTimeout(_) => "TimeoutError",
            SupervisorError::NotReady => "NotReadyError",
            SupervisorError::UpstreamStatus { .. } => "UpstreamStatusError",
            SupervisorError::UpstreamTimeout => "UpstreamTimeoutError",
            SupervisorError::InvalidPayload(_) => "UpstreamPayloadError",
            SupervisorError::ShuttingDown => "ShutdownError",
            SupervisorError::Validation(_) => "ValidationError",
            SupervisorError::Http(_) => "UpstreamError",
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
