//! In-process HTTP server for exercising the HTTP clients in tests.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// A request as seen by the mock.
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: String,
    pub path: String,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// What the mock sends back.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub status: u16,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub delay: Duration,
}

impl MockReply {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.as_bytes().to_vec(),
            headers: vec![("content-type".into(), "application/json".into())],
            delay: Duration::ZERO,
        }
    }

    pub fn bytes(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            body,
            headers: vec![("content-type".into(), "application/octet-stream".into())],
            delay: Duration::ZERO,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Responder = Box<dyn Fn(&MockRequest) -> MockReply + Send + Sync>;

#[derive(Default)]
struct Recorded {
    hits: HashMap<String, usize>,
    bodies: HashMap<String, Vec<String>>,
    headers: HashMap<String, Vec<HashMap<String, String>>>,
}

struct Shared {
    responder: Responder,
    requests: AtomicUsize,
    recorded: Mutex<Recorded>,
}

/// Answers every request through a responder closure until dropped.
pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&MockRequest) -> MockReply + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            responder: Box::new(responder),
            requests: AtomicUsize::new(0),
            recorded: Mutex::new(Recorded::default()),
        });
        let app = Router::new()
            .fallback(respond)
            .with_state(Arc::clone(&shared));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, shared, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Requests received on any path.
    pub fn requests(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    pub fn hits(&self, path: &str) -> usize {
        let recorded = self.shared.recorded.lock().unwrap();
        recorded.hits.get(path).copied().unwrap_or(0)
    }

    pub fn bodies(&self, path: &str) -> Vec<String> {
        let recorded = self.shared.recorded.lock().unwrap();
        recorded.bodies.get(path).cloned().unwrap_or_default()
    }

    pub fn headers(&self, path: &str) -> Vec<HashMap<String, String>> {
        let recorded = self.shared.recorded.lock().unwrap();
        recorded.headers.get(path).cloned().unwrap_or_default()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A local port with nothing listening on it.
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn respond(
    State(shared): State<Arc<Shared>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = MockRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        headers: headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect(),
        body: String::from_utf8_lossy(&body).into_owned(),
    };

    shared.requests.fetch_add(1, Ordering::SeqCst);
    {
        let mut recorded = shared.recorded.lock().unwrap();
        *recorded.hits.entry(request.path.clone()).or_default() += 1;
        recorded
            .bodies
            .entry(request.path.clone())
            .or_default()
            .push(request.body.clone());
        recorded
            .headers
            .entry(request.path.clone())
            .or_default()
            .push(request.headers.clone());
    }

    let reply = (shared.responder)(&request);
    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }

    let status = StatusCode::from_u16(reply.status).unwrap();
    let mut response = (status, reply.body).into_response();
    for (name, value) in reply.headers {
        response.headers_mut().insert(
            HeaderName::try_from(name).unwrap(),
            HeaderValue::try_from(value).unwrap(),
        );
    }
    response
}
