//! The invocation boundary: event in, `{statusCode, body}` out.

use crate::error::{Result, SupervisorError};
use crate::protocol::{InferenceRequest, InvocationResponse};
use crate::supervisor::Supervisor;
use serde_json::Value;
use tracing::{error, info, warn};

/// Handle one invocation event.
///
/// Every error becomes a response except a failed launch, which is returned
/// so the host can report the invocation as failed and recycle the sandbox.
pub async fn handle_event(supervisor: &Supervisor, event: Value) -> Result<InvocationResponse> {
    let default_n_predict = supervisor.config().forwarder.default_n_predict;
    let request = match InferenceRequest::from_event(event, default_n_predict) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejected request: {}", e);
            return Ok(InvocationResponse::from(&e));
        }
    };

    info!(
        "Processing request with prompt length: {}",
        request.prompt.chars().count()
    );

    match supervisor.infer(&request).await {
        Ok(payload) => Ok(InvocationResponse::success(payload)),
        Err(e @ SupervisorError::Launch(_)) => Err(e),
        Err(e) => {
            error!("Error processing request ({}): {}", e.kind(), e);
            Ok(InvocationResponse::from(&e))
        }
    }
}
