//! Serverless runtime loop.
//!
//! Long-polls the runtime API for the next event, hands it to the handler and
//! posts the result back. SIGTERM or Ctrl-C stops the inference server before
//! the process exits.

use crate::config::Config;
use crate::error::SupervisorError;
use crate::handler::handle_event;
use crate::protocol::InvocationResponse;
use crate::supervisor::Supervisor;
use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Environment variable carrying the runtime API host.
pub const RUNTIME_API_ENV: &str = "AWS_LAMBDA_RUNTIME_API";

const API_VERSION: &str = "2018-06-01";
const REQUEST_ID_HEADER: &str = "lambda-runtime-aws-request-id";
const DEADLINE_HEADER: &str = "lambda-runtime-deadline-ms";
const ERROR_TYPE_HEADER: &str = "Lambda-Runtime-Function-Error-Type";

/// One event pulled from the runtime API.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub request_id: String,
    /// Milliseconds since the epoch at which the host gives up.
    pub deadline_ms: Option<u64>,
    pub event: Value,
}

#[derive(Debug, Serialize)]
struct ErrorReport<'a> {
    #[serde(rename = "errorMessage")]
    message: String,
    #[serde(rename = "errorType")]
    error_type: &'a str,
}

/// Client for the runtime API.
pub struct RuntimeClient {
    client: Client,
    base_url: String,
}

impl RuntimeClient {
    /// Create a client for `host:port` (no scheme).
    pub fn new(api: &str) -> Result<Self> {
        // The next-invocation call blocks until an event arrives; no timeout.
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: format!("http://{}/{}/runtime", api, API_VERSION),
        })
    }

    pub fn from_env() -> Result<Self> {
        let api = std::env::var(RUNTIME_API_ENV).with_context(|| {
            format!(
                "{} is not set; is this running inside the function host?",
                RUNTIME_API_ENV
            )
        })?;
        Self::new(&api)
    }

    /// Block until the next event is available.
    pub async fn next_invocation(&self) -> Result<Invocation> {
        let url = format!("{}/invocation/next", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch next invocation")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Next invocation failed: {} - {}", status, body));
        }

        let headers = response.headers();
        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Invocation is missing the {} header", REQUEST_ID_HEADER))?;
        let deadline_ms = headers
            .get(DEADLINE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        let event = response
            .json()
            .await
            .context("Failed to parse invocation event")?;

        Ok(Invocation {
            request_id,
            deadline_ms,
            event,
        })
    }

    /// Report the handler's response.
    pub async fn send_response(
        &self,
        request_id: &str,
        response: &InvocationResponse,
    ) -> Result<()> {
        let url = format!("{}/invocation/{}/response", self.base_url, request_id);
        self.post(&url, response, None).await
    }

    /// Report a failed invocation.
    pub async fn send_error(&self, request_id: &str, err: &SupervisorError) -> Result<()> {
        let url = format!("{}/invocation/{}/error", self.base_url, request_id);
        let report = ErrorReport {
            message: err.to_string(),
            error_type: err.kind(),
        };
        self.post(&url, &report, Some("Unhandled")).await
    }

    /// Report a failure before the first invocation could be served.
    pub async fn send_init_error(&self, err: &anyhow::Error) -> Result<()> {
        let url = format!("{}/init/error", self.base_url);
        let report = ErrorReport {
            message: format!("{:#}", err),
            error_type: "InitError",
        };
        self.post(&url, &report, Some("Unhandled")).await
    }

    async fn post<T: Serialize>(
        &self,
        url: &str,
        body: &T,
        error_type: Option<&str>,
    ) -> Result<()> {
        let mut request = self.client.post(url).json(body);
        if let Some(error_type) = error_type {
            request = request.header(ERROR_TYPE_HEADER, error_type);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to post to {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Runtime API rejected {}: {} - {}", url, status, body));
        }
        Ok(())
    }
}

/// Serve invocations until the host asks us to stop.
///
/// With `warm`, the inference server is started during init instead of on
/// the first invocation.
pub async fn run(config: Config, warm: bool) -> Result<()> {
    let stop = CancellationToken::new();
    let signal = shutdown_signal();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            signal.await;
            info!("Received shutdown signal");
            stop.cancel();
        }
    });

    let runtime = RuntimeClient::from_env()?;
    let supervisor = match Supervisor::new(config) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            let err = anyhow::Error::new(e).context("Failed to initialize supervisor");
            if let Err(report) = runtime.send_init_error(&err).await {
                warn!("Failed to report init error: {:#}", report);
            }
            return Err(err);
        }
    };

    if warm {
        let started = tokio::select! {
            _ = stop.cancelled() => None,
            started = supervisor.get_or_create() => Some(started),
        };
        match started {
            None => {
                supervisor.shutdown().await;
                return Ok(());
            }
            Some(Ok(handle)) => info!(
                "Inference server warm on port {} (PID {:?})",
                handle.port, handle.pid
            ),
            Some(Err(e)) => {
                let err = anyhow::Error::new(e).context("Failed to start inference server");
                if let Err(report) = runtime.send_init_error(&err).await {
                    warn!("Failed to report init error: {:#}", report);
                }
                supervisor.shutdown().await;
                return Err(err);
            }
        }
    }

    info!("Waiting for invocations...");
    let result = serve(&runtime, &supervisor, &stop).await;
    supervisor.shutdown().await;
    result
}

/// Pull and dispatch invocations until `stop` is cancelled.
///
/// An invocation still being handled when `stop` fires is abandoned without
/// a report; the host is tearing the sandbox down anyway.
pub async fn serve(
    runtime: &RuntimeClient,
    supervisor: &Supervisor,
    stop: &CancellationToken,
) -> Result<()> {
    loop {
        let invocation = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            next = runtime.next_invocation() => next?,
        };
        let request_id = invocation.request_id.clone();
        debug!(
            "Invocation {} (deadline {:?})",
            request_id, invocation.deadline_ms
        );

        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                warn!("Invocation {} interrupted by shutdown", request_id);
                return Ok(());
            }
            dispatched = dispatch(runtime, supervisor, invocation) => dispatched?,
        }
    }
}

/// Handle one invocation and report its outcome.
pub async fn dispatch(
    runtime: &RuntimeClient,
    supervisor: &Supervisor,
    invocation: Invocation,
) -> Result<()> {
    match handle_event(supervisor, invocation.event).await {
        Ok(response) => runtime
            .send_response(&invocation.request_id, &response)
            .await,
        Err(e) => {
            error!("Invocation {} failed: {}", invocation.request_id, e);
            runtime.send_error(&invocation.request_id, &e).await
        }
    }
}

/// Resolves on SIGTERM or Ctrl-C.
///
/// The SIGTERM handler is installed when this is called, before the returned
/// future is first polled.
pub fn shutdown_signal() -> impl Future<Output = ()> {
    #[cfg(unix)]
    let term = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())
            .map_err(|e| warn!("Failed to install SIGTERM handler: {}", e))
            .ok()
    };

    async move {
        #[cfg(unix)]
        {
            if let Some(mut term) = term {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
                return;
            }
        }

        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::supervisor::launcher::{Launcher, ServerHandle};
    use crate::testing::{MockReply, MockServer};
    use std::time::Duration;

    /// Points the supervisor at a server it does not own.
    struct Detached(u16);

    impl Launcher for Detached {
        fn launch(&self, config: &ServerConfig) -> crate::error::Result<ServerHandle> {
            Ok(ServerHandle::detached(&config.host, self.0))
        }
    }

    fn api_host(server: &MockServer) -> String {
        server.base_url().trim_start_matches("http://").to_string()
    }

    const NEXT: &str = "/2018-06-01/runtime/invocation/next";

    #[tokio::test]
    async fn test_next_invocation_parses_headers() {
        let server = MockServer::start(|_| {
            MockReply::json(200, r#"{"prompt":"hello"}"#)
                .header("Lambda-Runtime-Aws-Request-Id", "req-1")
                .header("Lambda-Runtime-Deadline-Ms", "1700000000000")
        })
        .await;
        let runtime = RuntimeClient::new(&api_host(&server)).unwrap();

        let invocation = runtime.next_invocation().await.unwrap();

        assert_eq!(invocation.request_id, "req-1");
        assert_eq!(invocation.deadline_ms, Some(1_700_000_000_000));
        assert_eq!(invocation.event["prompt"], "hello");
        assert_eq!(server.hits(NEXT), 1);
    }

    #[tokio::test]
    async fn test_next_invocation_requires_request_id() {
        let server = MockServer::start(|_| MockReply::json(200, "{}")).await;
        let runtime = RuntimeClient::new(&api_host(&server)).unwrap();

        assert!(runtime.next_invocation().await.is_err());
    }

    #[tokio::test]
    async fn test_dispatch_posts_validation_response() {
        let server = MockServer::start(|_| MockReply::json(202, "{}")).await;
        let runtime = RuntimeClient::new(&api_host(&server)).unwrap();
        let supervisor = Supervisor::new(Config::default()).unwrap();
        let invocation = Invocation {
            request_id: "abc".into(),
            deadline_ms: None,
            event: serde_json::json!({}),
        };

        dispatch(&runtime, &supervisor, invocation).await.unwrap();

        let path = "/2018-06-01/runtime/invocation/abc/response";
        assert_eq!(server.hits(path), 1);
        let posted: InvocationResponse = serde_json::from_str(&server.bodies(path)[0]).unwrap();
        assert_eq!(posted.status_code, 400);
    }

    #[tokio::test]
    async fn test_dispatch_reports_launch_failure_as_error() {
        struct Broken;
        impl Launcher for Broken {
            fn launch(&self, _config: &ServerConfig) -> crate::error::Result<ServerHandle> {
                Err(SupervisorError::Launch("exec format error".into()))
            }
        }

        let server = MockServer::start(|_| MockReply::json(202, "{}")).await;
        let runtime = RuntimeClient::new(&api_host(&server)).unwrap();
        let supervisor = Supervisor::with_launcher(Config::default(), Box::new(Broken)).unwrap();
        let invocation = Invocation {
            request_id: "xyz".into(),
            deadline_ms: None,
            event: serde_json::json!({ "prompt": "hello" }),
        };

        dispatch(&runtime, &supervisor, invocation).await.unwrap();

        let path = "/2018-06-01/runtime/invocation/xyz/error";
        assert_eq!(server.hits(path), 1);
        let report: Value = serde_json::from_str(&server.bodies(path)[0]).unwrap();
        assert_eq!(report["errorType"], "LaunchError");
        let headers = &server.headers(path)[0];
        assert_eq!(
            headers.get("lambda-runtime-function-error-type").map(String::as_str),
            Some("Unhandled")
        );
    }

    #[tokio::test]
    async fn test_rejected_post_is_an_error() {
        let server = MockServer::start(|req| {
            assert_eq!(req.method, "POST");
            MockReply::json(400, r#"{"errorMessage":"invalid request id"}"#)
        })
        .await;
        let runtime = RuntimeClient::new(&api_host(&server)).unwrap();

        let result = runtime
            .send_response("gone", &InvocationResponse::error(500, "x"))
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_serve_stops_during_in_flight_invocation() {
        // One server plays both the runtime API and a slow llama-server.
        let server = MockServer::start(|req| match req.path.as_str() {
            NEXT => MockReply::json(200, r#"{"prompt":"hello"}"#)
                .header("Lambda-Runtime-Aws-Request-Id", "slow-1"),
            "/health" => MockReply::json(200, r#"{"status":"ok"}"#),
            "/completion" => {
                MockReply::json(200, r#"{"content":"late"}"#).delayed(Duration::from_secs(5))
            }
            _ => MockReply::json(202, "{}"),
        })
        .await;
        let runtime = RuntimeClient::new(&api_host(&server)).unwrap();
        let supervisor =
            Supervisor::with_launcher(Config::default(), Box::new(Detached(server.port())))
                .unwrap();
        let stop = CancellationToken::new();

        let cancel = {
            let stop = stop.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                stop.cancel();
            }
        };
        let (served, ()) = tokio::time::timeout(Duration::from_secs(3), async {
            tokio::join!(serve(&runtime, &supervisor, &stop), cancel)
        })
        .await
        .unwrap();

        served.unwrap();
        assert_eq!(server.hits(NEXT), 1);
        assert_eq!(server.hits("/completion"), 1);
        assert_eq!(
            server.hits("/2018-06-01/runtime/invocation/slow-1/response"),
            0
        );
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_serve_returns_when_already_stopped() {
        let server = MockServer::start(|_| MockReply::json(500, "{}")).await;
        let runtime = RuntimeClient::new(&api_host(&server)).unwrap();
        let supervisor = Supervisor::new(Config::default()).unwrap();
        let stop = CancellationToken::new();
        stop.cancel();

        serve(&runtime, &supervisor, &stop).await.unwrap();

        assert_eq!(server.requests(), 0);
    }
}
